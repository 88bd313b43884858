use std::time::Duration;

pub const STATIC_DIAGS_FILE: &str = "static-analysis.json";
pub const CUSTOM_DIAGS_FILE: &str = "custom-analysis.json";
pub const SANITIZER_DIAGS_SUFFIX: &str = "-sanitizers.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const COMPILER_OUTPUT_FILE: &str = "compiler.txt";
pub const CLANG_TIDY_EXPORT_FILE: &str = "clang-tidy.yaml";

pub const PROGRAM_NAME: &str = "program";
pub const INSTRUMENTED_EXTENSION: &str = "instr";
pub const INSTRUMENTATION_ARGS: [&str; 2] = ["-fsanitize=address,undefined", "-g"];

/// Sanitizers mirror their reports to the system log as well as stderr.
pub const SANITIZER_ENV: [(&str, &str); 2] = [
    ("ASAN_OPTIONS", "log_to_syslog=1"),
    ("UBSAN_OPTIONS", "log_to_syslog=1"),
];

pub const COMPILER_CANDIDATES: [&str; 3] = ["c++", "g++", "clang++"];
pub const CLANG_CANDIDATES: [&str; 2] = ["clang++", "clang"];
pub const CLANG_TIDY: &str = "clang-tidy";
pub const ANALYZER_WARNING_ARGS: [&str; 2] = ["-Wall", "-Wextra"];

pub const DEFAULT_FILE_SIZE_LIMIT: u64 = 10_000_000;
pub const TEST_TASK_LIMIT: u64 = 2;
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(30);
pub const BUILD_MEMORY_LIMIT: u64 = 2_000_000_000;

pub const UNIT_PREFIX: &str = "codegavel";
pub const DEFAULT_RUN_ID: &str = "runner";
pub const UNIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Extra wall time granted past the unit's own runtime ceiling before it is stopped by force.
pub const UNIT_STOP_GRACE: Duration = Duration::from_secs(5);

pub const RES_TX_ERR: &str = "Failed to send job result to res_tx";
