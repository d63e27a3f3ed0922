//! The classic crash-reporting walkthrough: wire up the reporter, then crash
//! on purpose three calls deep so the symbolicated backtrace has something to
//! show.
//!
//! ```text
//! cargo run --example crash
//! cargo run -- stackwalk crash_db/pending/<id>.dmp ./symbols
//! ```

use minidumper_demo::CrashReporter;

#[inline(never)]
fn level_three() {
    println!("Entering level_three()... BOOM!");
    // A deliberately invalid write, caught by the crash handler.
    unsafe { sadness_generator::raise_segfault() }
}

#[inline(never)]
fn level_two() {
    println!("Entering level_two()");
    level_three();
}

#[inline(never)]
fn level_one() {
    println!("Entering level_one()");
    level_two();
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("Entering main()");

    let database = match std::env::var_os("CRASH_DB") {
        Some(dir) => dir.into(),
        None => std::env::current_dir()
            .expect("no working directory")
            .join("crash_db"),
    };

    // Everything before spawn() runs in both the app and the reporter
    // process.
    let mut reporter = CrashReporter::new("minidumper-demo", env!("CARGO_PKG_VERSION"))
        .with_database(&database)
        .without_rate_limit()
        .on_report(|report| {
            println!(
                "crash report {} recorded at {}",
                report.id,
                report.minidump.display()
            );
        });

    // e.g. https://o0.ingest.sentry.io/api/0/minidump/?sentry_key=<key>
    match std::env::var("DEMO_UPLOAD_URL") {
        Ok(url) => reporter = reporter.with_upload_url(url),
        Err(_) => tracing::info!("DEMO_UPLOAD_URL not set, keeping reports local"),
    }

    // Everything after here runs in only the app process.
    let _guard = match reporter.spawn() {
        Ok(guard) => guard,
        Err(err) => {
            tracing::error!(error = %err, "crash reporting failed to initialize");
            std::process::exit(1);
        }
    };

    tracing::info!(database = %database.display(), "crash reporting ready");

    level_one();
}
