//! Sandbox backed by transient systemd units in the user's service manager.
pub mod journal;
mod proxy;

use std::io::{Read, Seek};
use std::os::fd::AsFd;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use zbus::blocking::Connection;
use zbus::proxy::CacheProperties;
use zbus::zvariant::{Fd, Value};

use crate::{
    constants::{DEFAULT_RUN_ID, UNIT_POLL_INTERVAL, UNIT_PREFIX, UNIT_STOP_GRACE},
    core::domain::{Cancellation, RunOutcome, RunStatus},
    core::probe,
    core::traits::sandbox::{LogQuery, RunRequest, Sandbox, SandboxError},
    systemd::journal::Journal,
    systemd::proxy::{ManagerProxy, ServiceProxy, UnitProxy},
};

pub fn unit_name(run_id: Option<&str>) -> String {
    format!("{UNIT_PREFIX}-{}.service", run_id.unwrap_or(DEFAULT_RUN_ID))
}

/// Maps the final unit state to a run status.
pub fn classify(sub_state: &str, result: &str, exit_status: i32) -> RunStatus {
    if sub_state == "failed" {
        return match result {
            "timeout" => RunStatus::Timeout,
            "oom-kill" => RunStatus::Oom,
            _ => RunStatus::Error,
        };
    }

    if exit_status != 0 {
        RunStatus::Error
    } else {
        RunStatus::Ok
    }
}

/// systemd reports unset accounting counters as `u64::MAX`.
fn counter(value: u64) -> u64 {
    if value == u64::MAX { 0 } else { value }
}

fn paths(dirs: &[impl AsRef<Path>]) -> Vec<String> {
    dirs.iter()
        .map(|dir| dir.as_ref().to_string_lossy().into_owned())
        .collect()
}

/// Confinement settings of the unit, without the standard stream descriptors.
fn unit_properties<'a>(request: &'a RunRequest, program: &Path) -> Vec<(&'static str, Value<'a>)> {
    let exec_start = vec![(
        program.to_string_lossy().into_owned(),
        request.command.clone(),
        false,
    )];

    let mut properties = vec![
        ("Description", Value::from("codegavel runner service")),
        ("ExecStart", Value::from(exec_start)),
        ("RemainAfterExit", Value::from(true)),
        ("AddRef", Value::from(true)),
        ("PrivateUsers", Value::from(true)),
        ("ProtectSystem", Value::from("strict")),
        ("ProtectHome", Value::from("read-only")),
        ("ReadOnlyPaths", Value::from(vec!["/".to_string()])),
        ("PrivateTmp", Value::from(true)),
        ("PrivateDevices", Value::from(true)),
        ("PrivateNetwork", Value::from(true)),
    ];

    let limits = &request.limits;

    if let Some(memory) = limits.memory_bytes {
        properties.push(("MemoryMax", Value::from(memory)));
        properties.push(("MemorySwapMax", Value::from(0u64)));
    }
    if let Some(size) = limits.file_size_bytes {
        properties.push(("LimitFSIZE", Value::from(size)));
    }
    if let Some(tasks) = limits.tasks {
        properties.push(("TasksMax", Value::from(tasks)));
    }
    if let Some(timeout) = limits.timeout {
        let usec = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX);
        properties.push(("RuntimeMaxUSec", Value::from(usec)));
    }
    if !request.writable_dirs.is_empty() {
        properties.push(("ReadWritePaths", Value::from(paths(&request.writable_dirs))));
    }
    if !request.env.is_empty() {
        let env: Vec<String> = request.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        properties.push(("Environment", Value::from(env)));
    }
    if let Some(dir) = &request.working_dir {
        properties.push(("WorkingDirectory", Value::from(dir.to_string_lossy().into_owned())));
    }

    properties
}

fn property_error(unit: &str, property: &'static str) -> impl FnOnce(zbus::Error) -> SandboxError {
    let unit = unit.to_string();
    move |e| SandboxError::Property {
        unit,
        property,
        msg: e.to_string(),
    }
}

/// Stops the unit and clears its failed state. Missing units are fine.
fn release(manager: &ManagerProxy<'_>, name: &str) {
    if let Err(e) = manager.stop_unit(name, "fail") {
        trace!("Stopping {name}: {e}");
    }
    if let Err(e) = manager.reset_failed_unit(name) {
        trace!("Resetting {name}: {e}");
    }
}

/// Releases the unit on every exit path, cancellation included.
struct UnitGuard<'a> {
    manager: &'a ManagerProxy<'a>,
    name: &'a str,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        release(self.manager, self.name);
        debug!("Released unit {}", self.name);
    }
}

#[derive(Clone, Debug)]
pub struct SystemdSandbox {
    conn: Connection,
    journal: Journal,
}

impl SystemdSandbox {
    /// Connects to the user's service manager on the session bus.
    pub fn connect() -> Result<Self, SandboxError> {
        let conn = Connection::session()?;
        Ok(Self {
            conn,
            journal: Journal::default(),
        })
    }

    fn manager(&self) -> Result<ManagerProxy<'static>, SandboxError> {
        Ok(ManagerProxy::new(&self.conn)?)
    }

    /// Polls until the unit has finished. `None` when it overran `deadline`.
    fn wait(
        &self,
        unit: &UnitProxy<'_>,
        name: &str,
        deadline: Option<Instant>,
        cancellation: &Cancellation,
    ) -> Result<Option<String>, SandboxError> {
        loop {
            if cancellation.is_cancelled() {
                warn!("Run in {name} cancelled");
                return Err(SandboxError::Cancelled);
            }

            let state = unit.sub_state().map_err(property_error(name, "SubState"))?;
            if state == "exited" || state == "failed" {
                return Ok(Some(state));
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Unit {name} outlived its runtime ceiling");
                return Ok(None);
            }

            thread::sleep(UNIT_POLL_INTERVAL);
        }
    }
}

impl Sandbox for SystemdSandbox {
    #[tracing::instrument(skip(self, request, cancellation), fields(run_id = ?request.run_id))]
    fn run(
        &self,
        request: RunRequest,
        cancellation: &Cancellation,
    ) -> Result<RunOutcome, SandboxError> {
        let program = request
            .command
            .first()
            .ok_or_else(|| SandboxError::InvalidRequest("empty command".to_string()))?;
        let program = probe::resolve_program(program).ok_or_else(|| {
            SandboxError::InvalidRequest(format!("{program} is not an executable"))
        })?;

        let name = unit_name(request.run_id.as_deref());

        let captured = match request.stderr {
            Some(_) => None,
            None => Some(tempfile::tempfile()?),
        };

        let mut properties = unit_properties(&request, &program);
        let streams = [
            ("StandardInputFileDescriptor", request.stdin.as_ref()),
            ("StandardOutputFileDescriptor", request.stdout.as_ref()),
            ("StandardErrorFileDescriptor", request.stderr.as_ref().or(captured.as_ref())),
        ];
        for (property, file) in streams {
            if let Some(file) = file {
                properties.push((property, Value::from(Fd::from(file.as_fd()))));
            }
        }

        let manager = self.manager()?;
        release(&manager, &name);

        manager
            .start_transient_unit(&name, "fail", &properties, &[])
            .map_err(|e| SandboxError::Start {
                unit: name.clone(),
                msg: e.to_string(),
            })?;
        let guard = UnitGuard {
            manager: &manager,
            name: &name,
        };
        debug!("Started unit {name}");

        let path = manager.get_unit(&name).map_err(|e| SandboxError::Start {
            unit: name.clone(),
            msg: e.to_string(),
        })?;
        let unit = UnitProxy::builder(&self.conn)
            .path(path.clone())?
            .cache_properties(CacheProperties::No)
            .build()?;
        let service = ServiceProxy::builder(&self.conn)
            .path(path)?
            .cache_properties(CacheProperties::No)
            .build()?;

        let deadline = request
            .limits
            .timeout
            .map(|timeout| Instant::now() + timeout + UNIT_STOP_GRACE);

        let status = match self.wait(&unit, &name, deadline, cancellation)? {
            Some(state) => {
                let result = service.result().map_err(property_error(&name, "Result"))?;
                let exit_status = service
                    .exec_main_status()
                    .map_err(property_error(&name, "ExecMainStatus"))?;
                classify(&state, &result, exit_status)
            }
            None => RunStatus::Timeout,
        };

        let cpu_time = service.cpu_usage_nsec().map(counter).unwrap_or_default();
        let peak_memory_bytes = service.memory_peak().map(counter).unwrap_or_default();
        drop(guard);

        let stderr = match captured {
            Some(mut file) => {
                let mut buf = Vec::new();
                file.rewind()?;
                file.read_to_end(&mut buf)?;
                Some(buf)
            }
            None => None,
        };

        info!(
            "Unit {name} finished: {status:?}, cpu {}ms, memory {peak_memory_bytes}B",
            cpu_time / 1_000_000
        );

        Ok(RunOutcome {
            status,
            cpu_time: Duration::from_nanos(cpu_time),
            peak_memory_bytes,
            stderr,
        })
    }

    fn read_log(&self, query: &LogQuery) -> Result<Vec<String>, SandboxError> {
        let unit = unit_name(query.run_id.as_deref());
        self.journal.read(Some(&unit), query)
    }

    fn version(&self) -> Result<String, SandboxError> {
        Ok(self.manager()?.version()?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::core::domain::RunLimits;

    use super::*;

    fn get<'a>(properties: &'a [(&str, Value<'a>)], key: &str) -> Option<&'a Value<'a>> {
        properties.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    #[test]
    fn test_unit_names_follow_run_id() {
        assert_eq!(unit_name(None), "codegavel-runner.service");
        assert_eq!(unit_name(Some("worker-3")), "codegavel-worker-3.service");
    }

    #[test]
    fn test_classify_failed_units_by_result() {
        assert_eq!(classify("failed", "timeout", 0), RunStatus::Timeout);
        assert_eq!(classify("failed", "oom-kill", 137), RunStatus::Oom);
        assert_eq!(classify("failed", "signal", 0), RunStatus::Error);
        assert_eq!(classify("failed", "exit-code", 1), RunStatus::Error);
    }

    #[test]
    fn test_classify_exited_units_by_status() {
        assert_eq!(classify("exited", "success", 0), RunStatus::Ok);
        assert_eq!(classify("exited", "success", 3), RunStatus::Error);
    }

    #[test]
    fn test_unset_counters_read_as_zero() {
        assert_eq!(counter(u64::MAX), 0);
        assert_eq!(counter(4096), 4096);
    }

    #[test]
    fn test_properties_always_confine() {
        let request = RunRequest {
            command: vec!["/bin/true".to_string()],
            limits: RunLimits {
                file_size_bytes: None,
                ..Default::default()
            },
            ..Default::default()
        };

        let properties = unit_properties(&request, Path::new("/bin/true"));

        for key in ["PrivateNetwork", "PrivateTmp", "PrivateDevices", "PrivateUsers"] {
            assert_eq!(get(&properties, key), Some(&Value::from(true)), "{key}");
        }
        assert_eq!(get(&properties, "ProtectSystem"), Some(&Value::from("strict")));
        for key in ["MemoryMax", "TasksMax", "RuntimeMaxUSec", "LimitFSIZE", "Environment"] {
            assert!(get(&properties, key).is_none(), "{key}");
        }
    }

    #[test]
    fn test_properties_carry_limits() {
        let request = RunRequest {
            command: vec!["prog".to_string(), "--fast".to_string()],
            limits: RunLimits {
                timeout: Some(Duration::from_millis(1500)),
                memory_bytes: Some(64_000_000),
                tasks: Some(2),
                file_size_bytes: Some(10_000_000),
            },
            writable_dirs: vec![PathBuf::from("/tmp/work")],
            env: vec![("ASAN_OPTIONS".to_string(), "log_to_syslog=1".to_string())],
            working_dir: Some(PathBuf::from("/tmp/work")),
            ..Default::default()
        };

        let properties = unit_properties(&request, Path::new("/tmp/work/prog"));

        assert_eq!(get(&properties, "MemoryMax"), Some(&Value::from(64_000_000u64)));
        assert_eq!(get(&properties, "MemorySwapMax"), Some(&Value::from(0u64)));
        assert_eq!(get(&properties, "TasksMax"), Some(&Value::from(2u64)));
        assert_eq!(get(&properties, "LimitFSIZE"), Some(&Value::from(10_000_000u64)));
        assert_eq!(get(&properties, "RuntimeMaxUSec"), Some(&Value::from(1_500_000u64)));
        assert_eq!(
            get(&properties, "Environment"),
            Some(&Value::from(vec!["ASAN_OPTIONS=log_to_syslog=1".to_string()]))
        );
        assert_eq!(
            get(&properties, "ReadWritePaths"),
            Some(&Value::from(vec!["/tmp/work".to_string()]))
        );
        assert_eq!(
            get(&properties, "WorkingDirectory"),
            Some(&Value::from("/tmp/work".to_string()))
        );
    }
}
