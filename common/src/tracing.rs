use std::sync::Once;

use tracing_subscriber::{filter::LevelFilter, EnvFilter};

static CURQ_LOG_ENV_VAR: &str = "CURQ_LOG";

/// List of crates in the workspace.
const CURQ_CRATES: &[&str] = &[
    "common",
    "data-store",
    "materializer",
    "query",
    "tests",
];

pub fn register_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Parse directives from RUST_LOG
        let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
        let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
        let mut env_filter = log_filter.parse(&directive_string).unwrap();

        let curq_log_level =
            std::env::var(CURQ_LOG_ENV_VAR).unwrap_or_else(|_| "debug".to_string());

        for crate_name in CURQ_CRATES {
            // Add directives for each crate in CURQ_CRATES, if not overriden by RUST_LOG
            let directive_name = crate_name.replace('-', "_");
            if !directive_string.contains(&format!("{directive_name}=")) {
                env_filter = env_filter.add_directive(
                    format!("{directive_name}={curq_log_level}").parse().unwrap(),
                );
            }
        }

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .init();
    });
}

/// If this fails, just update the above `CURQ_CRATES` to match reality.
#[test]
fn assert_curq_crates() {
    use cargo_metadata::MetadataCommand;

    let cmd = MetadataCommand::new().exec().unwrap();
    let mut names: Vec<String> = cmd
        .workspace_packages()
        .into_iter()
        .map(|pkg| pkg.name.clone())
        .collect();
    names.sort();
    assert_eq!(names, CURQ_CRATES);
}
