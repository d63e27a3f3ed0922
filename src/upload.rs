use crate::{Database, Error, Report};
use chrono::{DateTime, Duration, Utc};
use std::io::Write as _;

/// Field name both crashpad and sentry expect the dump under.
const MINIDUMP_FIELD: &str = "upload_file_minidump";

/// Posts crash reports to an ingestion endpoint as multipart/form-data, one
/// form field per annotation plus the minidump itself.
pub struct Uploader {
    url: String,
    rate_limit: Option<Duration>,
    agent: ureq::Agent,
}

impl Uploader {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            // One attempt per hour, the limit crash handlers conventionally
            // apply unless told otherwise.
            rate_limit: Some(Duration::hours(1)),
            agent: ureq::AgentBuilder::new()
                .timeout(std::time::Duration::from_secs(60))
                .build(),
        }
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    /// Uploads every pending report, oldest first. Returns how many were
    /// accepted; failures are logged and the affected reports stay pending
    /// for a later session. A throttled attempt stops the drain since every
    /// following report would be throttled too.
    pub fn upload_pending(&self, database: &Database) -> Result<usize, Error> {
        let mut accepted = 0;

        for report in database.pending_reports()? {
            match self.upload(database, &report) {
                Ok(()) => accepted += 1,
                Err(Error::UploadThrottled { not_before }) => {
                    tracing::info!(%not_before, "upload throttled, leaving reports pending");
                    break;
                }
                Err(err) => {
                    tracing::error!(report = %report.id, error = %err, "upload failed");
                }
            }
        }

        Ok(accepted)
    }

    /// Uploads a single report and moves it to `completed/` when the endpoint
    /// accepts it.
    pub fn upload(&self, database: &Database, report: &Report) -> Result<(), Error> {
        if let Some(window) = self.rate_limit {
            if let Some(not_before) = throttled_until(
                database.settings()?.last_upload_attempt,
                window,
                Utc::now(),
            ) {
                return Err(Error::UploadThrottled { not_before });
            }
        }

        // Attempts count against the limit whether or not they succeed.
        database.record_upload_attempt(Utc::now())?;

        let minidump = std::fs::read(&report.minidump)?;
        let file_name = format!("{}.dmp", report.id);

        let boundary = format!("------------------------{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&boundary, report, &file_name, &minidump);

        let response = self
            .agent
            .post(&self.url)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body);

        match response {
            Ok(response) => {
                tracing::info!(
                    report = %report.id,
                    status = response.status(),
                    "crash report uploaded"
                );
                database.mark_completed(report)?;
                Ok(())
            }
            Err(ureq::Error::Status(status, response)) => Err(Error::UploadRejected {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(err) => Err(Error::Upload(Box::new(err))),
        }
    }
}

/// Returns when the next attempt becomes permissible, or `None` if one is
/// allowed now.
fn throttled_until(
    last_attempt: Option<DateTime<Utc>>,
    window: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let not_before = last_attempt? + window;
    (now < not_before).then_some(not_before)
}

fn multipart_body(boundary: &str, report: &Report, file_name: &str, minidump: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(minidump.len() + 1024);

    for (key, value) in &report.annotations {
        let _ = write!(
            body,
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{key}\"\r\n\r\n{value}\r\n"
        );
    }

    let _ = write!(
        body,
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{MINIDUMP_FIELD}\"; \
         filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    );
    body.extend_from_slice(minidump);
    let _ = write!(body, "\r\n--{boundary}--\r\n");

    body
}
