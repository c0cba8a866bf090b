use std::path::{Path, PathBuf};
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
        other => panic!("unknown fixture: {other}"),
    }
}

/// A sample CSV started at `ts` on build `build`.
pub fn sample_csv(ts: i64, build: &str) -> String {
    fixture("csvprofile_template.csv")
        .replace("{TS}", &ts.to_string())
        .replace("{BUILD}", build)
}

/// Lay out an artifact root the way a finished pass leaves it.
#[allow(dead_code)]
pub fn write_artifacts(root: &Path, ts: i64, build: &str) -> PathBuf {
    let dir = root.join("Client/Profiling/FPSChartStats/run");
    std::fs::create_dir_all(&dir).unwrap();
    let csv = dir.join(format!("csvprofile_{ts}.csv"));
    std::fs::write(&csv, sample_csv(ts, build)).unwrap();
    std::fs::write(
        root.join("Client/ClientOutput.log"),
        "LogInit: Display: Soak client started\nAutoTest: Display: Route complete\n",
    )
    .unwrap();
    csv
}
