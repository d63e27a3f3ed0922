use crate::Error;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

const SETTINGS_FILE: &str = "settings.json";
const PENDING_DIR: &str = "pending";
const COMPLETED_DIR: &str = "completed";
const MINIDUMP_EXT: &str = "dmp";

/// Persistent per-database state, stored as `settings.json` in the root.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub uploads_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upload_attempt: Option<DateTime<Utc>>,
}

/// A single crash report: the minidump plus the record stored beside it.
#[derive(Debug, Clone)]
pub struct Report {
    pub id: uuid::Uuid,
    pub created_at: DateTime<Utc>,
    pub annotations: BTreeMap<String, String>,
    /// Path of the `.dmp` file in its current directory.
    pub minidump: PathBuf,
}

impl Report {
    /// Path of the record file stored beside the minidump.
    pub fn record_path(&self) -> PathBuf {
        self.minidump.with_extension("json")
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ReportRecord {
    id: uuid::Uuid,
    created_at: DateTime<Utc>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// Directory-backed store for crash reports.
///
/// ```text
/// <root>/settings.json
/// <root>/pending/<id>.dmp      minidumps awaiting upload (or kept forever
/// <root>/pending/<id>.json     when no endpoint is configured)
/// <root>/completed/...         reports that were accepted by the endpoint
/// ```
pub struct Database {
    root: PathBuf,
}

impl Database {
    /// Opens a database, creating the directory layout and default settings
    /// on first use.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_owned();

        fs::create_dir_all(root.join(PENDING_DIR))?;
        fs::create_dir_all(root.join(COMPLETED_DIR))?;

        let db = Self { root };

        if !db.settings_path().exists() {
            db.write_settings(&Settings::default())?;
        }

        Ok(db)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn settings(&self) -> Result<Settings, Error> {
        let contents = fs::read_to_string(self.settings_path())?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_settings(&self, settings: &Settings) -> Result<(), Error> {
        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), contents)?;
        Ok(())
    }

    pub fn set_uploads_enabled(&self, uploads_enabled: bool) -> Result<(), Error> {
        let mut settings = self.settings()?;
        settings.uploads_enabled = uploads_enabled;
        self.write_settings(&settings)
    }

    pub(crate) fn record_upload_attempt(&self, at: DateTime<Utc>) -> Result<(), Error> {
        let mut settings = self.settings()?;
        settings.last_upload_attempt = Some(at);
        self.write_settings(&settings)
    }

    /// Allocates the backing file for a new minidump under `pending/`.
    pub fn create_minidump_file(&self) -> Result<(File, PathBuf), io::Error> {
        let file_name = format!("{}.{MINIDUMP_EXT}", uuid::Uuid::new_v4());
        let path = self.root.join(PENDING_DIR).join(file_name);
        Ok((File::create(&path)?, path))
    }

    /// Writes the record for a freshly written minidump and returns the
    /// complete report.
    pub fn record_report(
        &self,
        minidump: &Path,
        annotations: BTreeMap<String, String>,
    ) -> Result<Report, Error> {
        let record = ReportRecord {
            id: id_from_path(minidump).unwrap_or_else(uuid::Uuid::new_v4),
            created_at: Utc::now(),
            annotations,
        };

        let report = Report {
            id: record.id,
            created_at: record.created_at,
            annotations: record.annotations.clone(),
            minidump: minidump.to_owned(),
        };

        fs::write(report.record_path(), serde_json::to_string_pretty(&record)?)?;

        Ok(report)
    }

    pub fn pending_reports(&self) -> Result<Vec<Report>, Error> {
        self.scan(PENDING_DIR)
    }

    pub fn completed_reports(&self) -> Result<Vec<Report>, Error> {
        self.scan(COMPLETED_DIR)
    }

    fn scan(&self, dir: &str) -> Result<Vec<Report>, Error> {
        let mut reports = Vec::new();

        for entry in fs::read_dir(self.root.join(dir))?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MINIDUMP_EXT) {
                continue;
            }

            reports.push(self.load_report(path));
        }

        reports.sort_by_key(|r| r.created_at);
        Ok(reports)
    }

    fn load_report(&self, minidump: PathBuf) -> Report {
        let record = fs::read_to_string(minidump.with_extension("json"))
            .ok()
            .and_then(|contents| serde_json::from_str::<ReportRecord>(&contents).ok());

        match record {
            Some(record) => Report {
                id: record.id,
                created_at: record.created_at,
                annotations: record.annotations,
                minidump,
            },
            // A crash between writing the dump and writing the record leaves
            // the record missing. The dump is still worth keeping, so recover
            // what the filesystem knows.
            None => {
                tracing::debug!(
                    minidump = %minidump.display(),
                    "missing or corrupt report record, synthesizing one"
                );

                Report {
                    id: id_from_path(&minidump).unwrap_or_else(uuid::Uuid::new_v4),
                    created_at: fs::metadata(&minidump)
                        .and_then(|md| md.modified())
                        .map(DateTime::from)
                        .unwrap_or_else(|_| Utc::now()),
                    annotations: BTreeMap::new(),
                    minidump,
                }
            }
        }
    }

    /// Moves a report's files to `completed/` after a successful upload.
    pub fn mark_completed(&self, report: &Report) -> Result<Report, Error> {
        let completed = self.root.join(COMPLETED_DIR);

        let minidump = completed.join(report.minidump.file_name().expect("minidump file name"));
        fs::rename(&report.minidump, &minidump)?;

        let record = report.record_path();
        if record.exists() {
            fs::rename(&record, completed.join(record.file_name().expect("record file name")))?;
        }

        Ok(Report {
            minidump,
            ..report.clone()
        })
    }
}

fn id_from_path(path: &Path) -> Option<uuid::Uuid> {
    path.file_stem()?.to_str()?.parse().ok()
}
