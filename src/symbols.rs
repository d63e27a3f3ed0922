use crate::{run_tool, Error};
use std::{
    fs,
    io::{BufRead as _, BufReader},
    path::{Path, PathBuf},
    process::Command,
};

/// A binary as `dump_syms` identifies it, parsed from the `MODULE` record on
/// the first line of its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
    pub os: String,
    pub cpu: String,
    pub debug_id: String,
    pub name: String,
}

impl BinaryInfo {
    /// Parses a `MODULE <os> <cpu> <debug id> <name>` record.
    pub fn parse(record: &str) -> Result<Self, Error> {
        let fields: Vec<&str> = record.trim_end().splitn(5, ' ').collect();

        match fields.as_slice() {
            ["MODULE", os, cpu, debug_id, name] if !name.is_empty() => Ok(Self {
                os: (*os).to_owned(),
                cpu: (*cpu).to_owned(),
                debug_id: (*debug_id).to_owned(),
                name: (*name).to_owned(),
            }),
            _ => Err(Error::BadModuleRecord(record.to_owned())),
        }
    }

    /// Layout stackwalkers expect: `<name>/<debug id>/<name>.sym`.
    pub fn sym_path(&self) -> PathBuf {
        PathBuf::from(&self.name)
            .join(&self.debug_id)
            .join(format!("{}.sym", self.name))
    }
}

pub struct SymbolDumpOptions {
    /// The `dump_syms` executable to invoke.
    pub dump_syms: PathBuf,
    /// Worker threads dumping binaries in parallel.
    pub jobs: usize,
    /// Empty the symbol directory before dumping.
    pub clear: bool,
}

impl Default for SymbolDumpOptions {
    fn default() -> Self {
        Self {
            dump_syms: PathBuf::from("dump_syms"),
            jobs: std::thread::available_parallelism().map_or(1, |n| n.get()),
            clear: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SymbolDumpSummary {
    /// Symbol files written, one per dumped binary.
    pub written: Vec<PathBuf>,
    /// Binaries skipped because their symbol file already existed.
    pub skipped: Vec<PathBuf>,
    /// Binaries that could not be dumped, with the failure rendered.
    pub failed: Vec<(PathBuf, String)>,
}

/// Dumps breakpad symbols for `binary` and every shared library it pulls in
/// from its own build directory, into the `<name>/<debug id>/<name>.sym`
/// layout under `symbols_dir`.
pub fn dump_symbols(
    binary: &Path,
    symbols_dir: &Path,
    options: &SymbolDumpOptions,
) -> Result<SymbolDumpSummary, Error> {
    let binary = binary.canonicalize()?;

    if options.clear {
        let _ = fs::remove_dir_all(symbols_dir);
    }
    fs::create_dir_all(symbols_dir)?;

    let binaries = transitive_dependencies(&binary);
    tracing::debug!(count = binaries.len(), "binaries to dump");

    let (work_tx, work_rx) = crossbeam_channel::unbounded();
    for binary in binaries {
        let _ = work_tx.send(binary);
    }
    drop(work_tx);

    let (result_tx, result_rx) = crossbeam_channel::unbounded();

    std::thread::scope(|scope| {
        for _ in 0..options.jobs.max(1) {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();

            scope.spawn(move || {
                for binary in work_rx {
                    let outcome = dump_one(&binary, symbols_dir, options);
                    if result_tx.send((binary, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut summary = SymbolDumpSummary::default();

    for (binary, outcome) in result_rx {
        match outcome {
            Ok(Outcome::Written(path)) => {
                tracing::info!(binary = %binary.display(), symbols = %path.display(), "dumped");
                summary.written.push(path);
            }
            Ok(Outcome::AlreadyPresent) => {
                tracing::debug!(binary = %binary.display(), "symbol file already present");
                summary.skipped.push(binary);
            }
            Err(err) => {
                tracing::error!(binary = %binary.display(), error = %err, "dump failed");
                summary.failed.push((binary, err.to_string()));
            }
        }
    }

    Ok(summary)
}

enum Outcome {
    Written(PathBuf),
    AlreadyPresent,
}

fn dump_one(binary: &Path, symbols_dir: &Path, options: &SymbolDumpOptions) -> Result<Outcome, Error> {
    let output = run_tool(Command::new(&options.dump_syms).arg(binary))?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    let info = BinaryInfo::parse(stdout.lines().next().unwrap_or_default())?;

    let sym_path = symbols_dir.join(info.sym_path());
    if sym_path.exists() {
        return Ok(Outcome::AlreadyPresent);
    }

    create_symbol_dir(&sym_path, &info)?;

    // A pre-generated `<binary>.breakpad*` file for the same module beats the
    // freshly captured output, it may carry inlinee data from a larger run.
    if let Some(local) = local_symbol_file(binary, &info) {
        fs::copy(&local, &sym_path)?;
        return Ok(Outcome::Written(sym_path));
    }

    fs::write(&sym_path, stdout.as_bytes())?;
    Ok(Outcome::Written(sym_path))
}

/// Creates `<name>/<debug id>/`, plus the all-zeroes debug-id fallback link
/// used when a crashed module carries no build id.
fn create_symbol_dir(sym_path: &Path, info: &BinaryInfo) -> Result<(), Error> {
    let id_dir = sym_path.parent().expect("sym path has an id directory");
    fs::create_dir_all(id_dir)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let zero_id = "0".repeat(33);
        let _ = std::os::unix::fs::symlink(
            &info.debug_id,
            id_dir.parent().expect("sym path has a name directory").join(zero_id),
        );
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = info;

    Ok(())
}

/// Looks for `<binary>.breakpad*` beside the binary, accepting it only when
/// its MODULE record matches the binary we just probed.
fn local_symbol_file(binary: &Path, info: &BinaryInfo) -> Option<PathBuf> {
    let dir = binary.parent()?;
    let prefix = format!("{}.breakpad", binary.file_name()?.to_str()?);

    for entry in fs::read_dir(dir).ok()?.filter_map(|e| e.ok()) {
        if !entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix))
        {
            continue;
        }

        let Ok(file) = fs::File::open(entry.path()) else {
            continue;
        };

        let mut first_line = String::new();
        if BufReader::new(file).read_line(&mut first_line).is_ok()
            && BinaryInfo::parse(&first_line).ok().as_ref() == Some(info)
        {
            return Some(entry.path());
        }
    }

    None
}

/// The binary plus its shared-library dependencies, restricted to libraries
/// living under the binary's own directory. System libraries have their
/// symbols elsewhere and would bloat the symbol store.
fn transitive_dependencies(binary: &Path) -> Vec<PathBuf> {
    let mut binaries = vec![binary.to_owned()];

    let build_dir = match binary.parent() {
        Some(dir) => dir,
        None => return binaries,
    };

    for dep in shared_library_dependencies(binary) {
        if dep.exists() && dep.parent().is_some_and(|p| p.starts_with(build_dir)) {
            binaries.push(dep);
        }
    }

    binaries.sort();
    binaries.dedup();
    binaries
}

/// `ldd` already reports the transitive closure on linux. A failure (static
/// binary, non-ELF input, missing ldd) just means there is nothing beyond the
/// binary itself.
#[cfg(target_os = "linux")]
fn shared_library_dependencies(binary: &Path) -> Vec<PathBuf> {
    match run_tool(Command::new("ldd").arg(binary)) {
        Ok(output) => parse_ldd_output(&String::from_utf8_lossy(&output.stdout)),
        Err(err) => {
            tracing::debug!(binary = %binary.display(), error = %err, "ldd not usable");
            Vec::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn shared_library_dependencies(_binary: &Path) -> Vec<PathBuf> {
    Vec::new()
}

/// Parses `ldd` lines of the form `\tname => path (0xaddr)`, dropping
/// unresolved and virtual entries.
fn parse_ldd_output(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let (_, resolved) = line.split_once("=>")?;
            let resolved = resolved
                .rsplit_once('(')
                .map_or(resolved, |(path, _)| path)
                .trim();

            if resolved.is_empty() || resolved == "not found" {
                None
            } else {
                Some(PathBuf::from(resolved))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE_RECORD: &str = "MODULE Linux x86_64 4FC10E4A583C3BF38E1E5CE5F45F3AAA0 crash";

    #[test]
    fn parses_module_record() {
        let info = BinaryInfo::parse(MODULE_RECORD).unwrap();
        assert_eq!(info.os, "Linux");
        assert_eq!(info.cpu, "x86_64");
        assert_eq!(info.debug_id, "4FC10E4A583C3BF38E1E5CE5F45F3AAA0");
        assert_eq!(info.name, "crash");
        assert_eq!(
            info.sym_path(),
            PathBuf::from("crash/4FC10E4A583C3BF38E1E5CE5F45F3AAA0/crash.sym")
        );
    }

    #[test]
    fn module_names_may_contain_spaces() {
        let info = BinaryInfo::parse("MODULE mac arm64 AAAA My Framework").unwrap();
        assert_eq!(info.name, "My Framework");
    }

    #[test]
    fn rejects_malformed_module_records() {
        for record in ["", "MODULE Linux x86_64", "FUNC 1130 46 0 main", "INFO x y z w"] {
            assert!(
                matches!(BinaryInfo::parse(record), Err(Error::BadModuleRecord(_))),
                "accepted {record:?}"
            );
        }
    }

    #[test]
    fn parses_ldd_output() {
        let output = "\tlinux-vdso.so.1 (0x00007ffd2a5f2000)\n\
                      \tlibgcc_s.so.1 => /lib/x86_64-linux-gnu/libgcc_s.so.1 (0x00007f2a1c000000)\n\
                      \tlibmissing.so => not found\n\
                      \tlibdemo.so => /home/user/build/libdemo.so (0x00007f2a1b000000)\n\
                      \t/lib64/ld-linux-x86-64.so.2 (0x00007f2a1d000000)\n";

        let deps = parse_ldd_output(output);
        assert_eq!(
            deps,
            vec![
                PathBuf::from("/lib/x86_64-linux-gnu/libgcc_s.so.1"),
                PathBuf::from("/home/user/build/libdemo.so"),
            ]
        );
    }

    #[cfg(unix)]
    mod with_stub_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt as _;

        /// Writes an executable shell script standing in for `dump_syms`.
        fn stub_dump_syms(dir: &Path) -> PathBuf {
            let path = dir.join("dump_syms");
            fs::write(
                &path,
                format!("#!/bin/sh\necho \"{MODULE_RECORD}\"\necho \"FUNC 1130 46 0 main\"\n"),
            )
            .unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn options(dir: &Path) -> SymbolDumpOptions {
            SymbolDumpOptions {
                dump_syms: stub_dump_syms(dir),
                jobs: 2,
                clear: false,
            }
        }

        #[test]
        fn writes_symbols_into_keyed_layout() {
            let dir = tempfile::tempdir().unwrap();
            let binary = dir.path().join("crash");
            fs::write(&binary, b"not really an ELF").unwrap();

            let symbols_dir = dir.path().join("symbols");
            let summary = dump_symbols(&binary, &symbols_dir, &options(dir.path())).unwrap();

            assert_eq!(summary.written.len(), 1);
            assert!(summary.failed.is_empty());

            let sym = symbols_dir.join("crash/4FC10E4A583C3BF38E1E5CE5F45F3AAA0/crash.sym");
            let contents = fs::read_to_string(&sym).unwrap();
            assert!(contents.starts_with("MODULE "));
            assert!(contents.contains("FUNC 1130 46 0 main"));

            #[cfg(target_os = "linux")]
            assert!(symbols_dir.join("crash").join("0".repeat(33)).exists());
        }

        #[test]
        fn second_run_skips_existing_symbols() {
            let dir = tempfile::tempdir().unwrap();
            let binary = dir.path().join("crash");
            fs::write(&binary, b"bin").unwrap();
            let symbols_dir = dir.path().join("symbols");
            let options = options(dir.path());

            dump_symbols(&binary, &symbols_dir, &options).unwrap();
            let summary = dump_symbols(&binary, &symbols_dir, &options).unwrap();

            assert!(summary.written.is_empty());
            assert_eq!(summary.skipped.len(), 1);
        }

        #[test]
        fn clear_discards_previous_symbols() {
            let dir = tempfile::tempdir().unwrap();
            let binary = dir.path().join("crash");
            fs::write(&binary, b"bin").unwrap();
            let symbols_dir = dir.path().join("symbols");

            let mut options = options(dir.path());
            dump_symbols(&binary, &symbols_dir, &options).unwrap();

            options.clear = true;
            let summary = dump_symbols(&binary, &symbols_dir, &options).unwrap();
            assert_eq!(summary.written.len(), 1);
        }

        #[test]
        fn matching_local_symbol_file_wins() {
            let dir = tempfile::tempdir().unwrap();
            let binary = dir.path().join("crash");
            fs::write(&binary, b"bin").unwrap();
            fs::write(
                dir.path().join("crash.breakpad"),
                format!("{MODULE_RECORD}\nFUNC ffff 1 0 from_local_file\n"),
            )
            .unwrap();

            let symbols_dir = dir.path().join("symbols");
            dump_symbols(&binary, &symbols_dir, &options(dir.path())).unwrap();

            let sym = symbols_dir.join("crash/4FC10E4A583C3BF38E1E5CE5F45F3AAA0/crash.sym");
            assert!(fs::read_to_string(sym).unwrap().contains("from_local_file"));
        }

        #[test]
        fn tool_failures_are_reported_per_binary() {
            let dir = tempfile::tempdir().unwrap();
            let binary = dir.path().join("crash");
            fs::write(&binary, b"bin").unwrap();

            let tool = dir.path().join("dump_syms");
            fs::write(&tool, "#!/bin/sh\necho boom >&2\nexit 1\n").unwrap();
            fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

            let summary = dump_symbols(
                &binary,
                &dir.path().join("symbols"),
                &SymbolDumpOptions {
                    dump_syms: tool,
                    jobs: 1,
                    clear: false,
                },
            )
            .unwrap();

            assert_eq!(summary.failed.len(), 1);
            assert!(summary.failed[0].1.contains("boom"));
        }
    }
}
