use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

pub fn fixture(name: &str) -> &'static str {
    match name {
        "csvprofile_template.csv" => include_str!("../fixtures/csvprofile_template.csv"),
        "soak_pass.log" => include_str!("../fixtures/soak_pass.log"),
        other => panic!("unknown fixture: {other}"),
    }
}

pub fn sample_csv(ts: i64, build: &str) -> String {
    fixture("csvprofile_template.csv")
        .replace("{TS}", &ts.to_string())
        .replace("{BUILD}", build)
}
