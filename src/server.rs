use crate::{Database, Error, OnMessage, OnReport, Uploader, ANNOTATIONS_KIND};
use minidumper::{LoopAction, MinidumpBinary, Server, ServerHandler};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Write as _},
    path::PathBuf,
    sync::atomic::AtomicBool,
    sync::Mutex,
    time::Duration,
};

pub(crate) struct Options {
    pub socket_name: String,
    pub database_dir: PathBuf,
    pub annotations: BTreeMap<String, String>,
    pub upload_url: Option<String>,
    pub rate_limit: bool,
    pub stale_timeout: u64,
    pub on_report: Option<OnReport>,
    pub on_message: Option<OnMessage>,
}

struct Handler {
    database: Database,
    uploader: Option<Uploader>,
    /// Annotation snapshot applied to the next report. Seeded from the
    /// builder, replaced/merged by kind-0 messages from the monitored process.
    annotations: Mutex<BTreeMap<String, String>>,
    on_report: Option<OnReport>,
    on_message: Option<OnMessage>,
}

impl ServerHandler for Handler {
    /// Called when a crash has been received and a backing file needs to be
    /// created to store it.
    fn create_minidump_file(&self) -> Result<(File, PathBuf), io::Error> {
        self.database.create_minidump_file()
    }

    /// Called when a crash has been fully written as a minidump to the
    /// provided file.
    fn on_minidump_created(&self, result: Result<MinidumpBinary, minidumper::Error>) -> LoopAction {
        match result {
            Ok(mut minidump) => {
                let _ = minidump.file.flush();

                let annotations = self
                    .annotations
                    .lock()
                    .map(|a| a.clone())
                    .unwrap_or_default();

                match self.database.record_report(&minidump.path, annotations) {
                    Ok(report) => {
                        tracing::info!(
                            report = %report.id,
                            minidump = %report.minidump.display(),
                            "crash report recorded"
                        );

                        if let Some(uploader) = &self.uploader {
                            if let Err(err) = uploader.upload(&self.database, &report) {
                                tracing::error!(report = %report.id, error = %err, "upload failed");
                            }
                        }

                        if let Some(on_report) = &self.on_report {
                            on_report(&report);
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "failed to record crash report");
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to write minidump");
            }
        }

        // The monitored process is gone after a crash, there is nothing left
        // to watch. Tells the server to exit, which will in turn exit the
        // reporter process.
        LoopAction::Exit
    }

    fn on_message(&self, kind: u32, buffer: Vec<u8>) {
        if kind == ANNOTATIONS_KIND {
            match serde_json::from_slice::<BTreeMap<String, String>>(&buffer) {
                Ok(update) => {
                    if let Ok(mut annotations) = self.annotations.lock() {
                        annotations.extend(update);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "discarding malformed annotation update");
                }
            }
        } else if let Some(on_message) = &self.on_message {
            on_message(kind, buffer);
        }
    }

    fn on_client_disconnected(&self, _num_clients: usize) -> LoopAction {
        LoopAction::Exit
    }
}

/// Runs the crash reporter process until the monitored process crashes or
/// goes away.
pub(crate) fn start(options: Options) -> Result<(), Error> {
    let database = Database::open(&options.database_dir)?;

    let uploader = options.upload_url.map(|url| {
        let uploader = Uploader::new(url);
        if options.rate_limit {
            uploader
        } else {
            uploader.without_rate_limit()
        }
    });

    // Reports from earlier sessions may still be sitting in pending/, either
    // because uploads were disabled or because the endpoint refused them.
    if let Some(uploader) = &uploader {
        match uploader.upload_pending(&database) {
            Ok(0) => {}
            Ok(accepted) => tracing::info!(accepted, "uploaded reports from earlier sessions"),
            Err(err) => tracing::error!(error = %err, "failed to drain pending reports"),
        }
    }

    let mut server = Server::with_name(options.socket_name.as_str())?;

    let handler = Box::new(Handler {
        database,
        uploader,
        annotations: Mutex::new(options.annotations),
        on_report: options.on_report,
        on_message: options.on_message,
    });

    let shutdown = AtomicBool::new(false);
    let stale_timeout = Some(Duration::from_millis(options.stale_timeout));

    server.run(handler, &shutdown, stale_timeout)?;

    Ok(())
}
