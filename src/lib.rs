//! Wires an application into out-of-process crash reporting and provides the
//! post-processing half of the pipeline: breakpad symbol generation and
//! minidump stackwalking via the external `dump_syms` and `minidump-stackwalk`
//! tools.
//!
//! The capture side follows the usual out-of-process handler model: the
//! application re-executes itself as a crash reporter process, attaches an
//! in-process [`crash_handler::CrashHandler`], and asks the reporter over IPC
//! to write the minidump when a crash occurs. Dumps land in a [`Database`]
//! directory together with a small report record, and are optionally posted to
//! a crash-ingestion endpoint.

use std::{collections::BTreeMap, path::PathBuf, process, sync::Arc};

mod client;
mod database;
mod server;
mod stackwalk;
mod symbols;
mod upload;

pub use database::{Database, Report, Settings};
pub use stackwalk::{stackwalk, StackwalkOptions};
pub use symbols::{dump_symbols, BinaryInfo, SymbolDumpOptions, SymbolDumpSummary};
pub use upload::Uploader;

/// Message kind reserved for annotation updates sent from the monitored
/// process to the reporter. All other kinds pass through to `on_message`.
pub const ANNOTATIONS_KIND: u32 = 0;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    CrashHandler(#[from] crash_handler::Error),
    #[error(transparent)]
    Minidumper(#[from] minidumper::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to run {tool}: {source}")]
    Tool {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: process::ExitStatus,
        stderr: String,
    },
    #[error("unrecognized MODULE record: {0:?}")]
    BadModuleRecord(String),
    #[error("upload rejected with status {status}: {body}")]
    UploadRejected { status: u16, body: String },
    #[error("upload failed: {0}")]
    Upload(#[from] Box<ureq::Error>),
    #[error("upload throttled, next attempt allowed after {not_before}")]
    UploadThrottled {
        not_before: chrono::DateTime<chrono::Utc>,
    },
}

pub struct ReporterHandle {
    client: Arc<minidumper::Client>,
    _handler: crash_handler::CrashHandler,
    _child: process::Child,
}

impl ReporterHandle {
    /// Sends a raw message to the reporter process. Kind [`ANNOTATIONS_KIND`]
    /// is reserved.
    pub fn send_message(&self, kind: u32, buf: impl AsRef<[u8]>) -> Result<(), Error> {
        self.client.send_message(kind, buf).map_err(Error::from)
    }

    /// Adds or replaces an annotation on reports recorded from now on.
    pub fn set_annotation(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        let update = BTreeMap::from([(key.into(), value.into())]);
        self.client
            .send_message(ANNOTATIONS_KIND, serde_json::to_vec(&update)?)
            .map_err(Error::from)
    }
}

pub type OnReport = Box<dyn Fn(&Report) + Send + Sync + 'static>;
pub type OnMessage = Box<dyn Fn(u32, Vec<u8>) + Send + Sync + 'static>;

/// Builder that wires the current process into crash reporting.
///
/// Construction happens in both the application and the reporter process,
/// since the reporter is this same executable re-run with
/// `--crash-reporter-server=<socket>`; [`CrashReporter::spawn`] tells the two
/// roles apart.
pub struct CrashReporter {
    database_dir: PathBuf,
    annotations: BTreeMap<String, String>,
    upload_url: Option<String>,
    rate_limit: bool,
    reporter_exe: Option<PathBuf>,
    server_stale_timeout: u64,
    client_connect_timeout: u64,
    server_arg: String,
    on_report: Option<OnReport>,
    on_message: Option<OnMessage>,
}

impl CrashReporter {
    /// `product` and `version` become the annotation pair sent with every
    /// report.
    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn new(product: impl Into<String>, version: impl Into<String>) -> Self {
        let annotations = BTreeMap::from([
            ("product".to_owned(), product.into()),
            ("version".to_owned(), version.into()),
        ]);

        Self {
            database_dir: std::env::temp_dir().join("minidumper-demo-db"),
            annotations,
            upload_url: None,
            rate_limit: true,
            reporter_exe: None,
            server_stale_timeout: 5000,
            client_connect_timeout: 3000,
            server_arg: "--crash-reporter-server".to_string(),
            on_report: None,
            on_message: None,
        }
    }

    pub fn is_reporter_process(&self) -> bool {
        std::env::args().any(|arg| arg.starts_with(&self.server_arg))
    }

    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn with_database(mut self, dir: impl Into<PathBuf>) -> Self {
        self.database_dir = dir.into();
        self
    }

    /// Endpoint that accepts a multipart minidump POST, e.g. a sentry
    /// `/api/<project>/minidump/?sentry_key=<key>` URL. Without one, reports
    /// are only recorded locally.
    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }

    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Uploads are normally throttled to one attempt per hour.
    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = false;
        self
    }

    /// Runs a dedicated executable as the reporter process instead of
    /// re-executing the current one.
    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn with_reporter_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.reporter_exe = Some(exe.into());
        self
    }

    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn with_server_stale_timeout(mut self, server_stale_timeout: u64) -> Self {
        self.server_stale_timeout = server_stale_timeout;
        self
    }

    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn with_client_connect_timeout(mut self, client_connect_timeout: u64) -> Self {
        self.client_connect_timeout = client_connect_timeout;
        self
    }

    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn with_server_arg(mut self, server_arg: String) -> Self {
        self.server_arg = server_arg;
        self
    }

    /// Runs in the reporter process after a report has been recorded.
    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn on_report<F>(mut self, on_report: F) -> Self
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        self.on_report = Some(Box::new(on_report));
        self
    }

    /// Runs in the reporter process for messages with a non-reserved kind.
    #[must_use = "You should call spawn() or the crash reporter won't be enabled"]
    pub fn on_message<F>(mut self, on_message: F) -> Self
    where
        F: Fn(u32, Vec<u8>) + Send + Sync + 'static,
    {
        self.on_message = Some(Box::new(on_message));
        self
    }

    #[must_use = "The return value of spawn() should not be dropped until the program exits"]
    pub fn spawn(self) -> Result<ReporterHandle, Error> {
        let server_socket = std::env::args()
            .find(|arg| arg.starts_with(&self.server_arg))
            .and_then(|arg| arg.split('=').last().map(|arg| arg.to_string()));

        if let Some(socket_name) = server_socket {
            server::start(server::Options {
                socket_name,
                database_dir: self.database_dir,
                annotations: self.annotations,
                upload_url: self.upload_url,
                rate_limit: self.rate_limit,
                stale_timeout: self.server_stale_timeout,
                on_report: self.on_report,
                on_message: self.on_message,
            })?;

            // The application code following spawn() must not run in the
            // reporter process.
            std::process::exit(0);
        }

        // Fail before a reporter process is ever spawned if the database
        // cannot be opened or its settings are unreadable.
        let database = Database::open(&self.database_dir)?;
        if database.settings()?.uploads_enabled != self.upload_url.is_some() {
            database.set_uploads_enabled(self.upload_url.is_some())?;
        }

        // One reporter process per application instance, so the socket name
        // just needs to not collide.
        let socket_name = make_socket_name(uuid::Uuid::new_v4());

        let reporter_exe = match &self.reporter_exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()?,
        };

        let reporter_process = process::Command::new(reporter_exe)
            .arg(format!("{}={}", &self.server_arg, socket_name))
            .spawn()?;

        let (client, handler) = client::start(
            &socket_name,
            self.client_connect_timeout,
            reporter_process.id(),
            self.server_stale_timeout / 2,
        )?;

        // Ship the initial annotation map before returning so that it is in
        // place for the very first crash.
        client.send_message(ANNOTATIONS_KIND, serde_json::to_vec(&self.annotations)?)?;

        Ok(ReporterHandle {
            client,
            _handler: handler,
            _child: reporter_process,
        })
    }
}

pub(crate) fn make_socket_name(session_id: uuid::Uuid) -> String {
    if cfg!(any(target_os = "linux", target_os = "android")) {
        format!("minidumper-demo-{}", session_id.simple())
    } else {
        // For platforms without abstract uds, put the pipe in the
        // temporary directory so that the OS can clean it up, rather than
        // polluting the cwd due to annoying file deletion problems,
        // particularly on Windows
        let mut td = std::env::temp_dir();
        td.push(format!("minidumper-demo-{}", session_id.simple()));
        td.to_string_lossy().to_string()
    }
}

/// Runs an external tool to completion, mapping spawn failures and non-zero
/// exits to [`Error::Tool`] and [`Error::ToolFailed`].
pub(crate) fn run_tool(command: &mut process::Command) -> Result<process::Output, Error> {
    let tool = command.get_program().to_string_lossy().into_owned();

    let output = command.output().map_err(|source| Error::Tool {
        tool: tool.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(Error::ToolFailed {
            tool,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_names_are_unique_per_session() {
        let a = make_socket_name(uuid::Uuid::new_v4());
        let b = make_socket_name(uuid::Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.contains("minidumper-demo-"));
    }

    #[test]
    fn builder_seeds_product_and_version_annotations() {
        let reporter = CrashReporter::new("demo", "0.1").with_annotation("channel", "nightly");
        assert_eq!(reporter.annotations["product"], "demo");
        assert_eq!(reporter.annotations["version"], "0.1");
        assert_eq!(reporter.annotations["channel"], "nightly");
    }
}
