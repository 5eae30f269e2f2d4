use crate::error::RunnerError;
use crate::transport::{shell_quote, CommandRunner};
use bench_core::ProfilingVariant;
use std::path::{Path, PathBuf};
use tracing::info;

/// Local file name for a retrieved profiling archive.
pub fn archive_name(test_name: &str, variant: &ProfilingVariant) -> String {
    format!(
        "{}-{}-{}.tar.gz",
        test_name,
        variant.operation.as_str(),
        variant.file_set
    )
}

/// Compresses the profiler's output directory for `test_name` on the execution
/// target and copies the archive into `target_dir`.
pub fn retrieve(
    runner: &CommandRunner,
    test_name: &str,
    variant: &ProfilingVariant,
    target_dir: &Path,
) -> Result<PathBuf, RunnerError> {
    let base = format!(
        "{}/{}",
        runner.out_folder().trim_end_matches('/'),
        shell_quote(test_name)
    );
    let listing = runner
        .exec(&format!("find {} -mindepth 1 -maxdepth 1 -type d", base))
        .map_err(|e| RunnerError::Retrieval(format!("cannot list {}: {}", base, e)))?;
    let mut dirs: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    dirs.sort_unstable();
    let source_dir = dirs
        .first()
        .ok_or_else(|| RunnerError::Retrieval(format!("no profiler output directory in {}", base)))?;
    let dir_name = source_dir
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| RunnerError::Retrieval(format!("unusable output path {}", source_dir)))?;

    let archive = format!("{}/{}.tar.gz", base, shell_quote(dir_name));
    info!(
        test = test_name,
        operation = %variant.operation,
        file_set = %variant.file_set,
        source = %source_dir,
        "compressing profiler output"
    );
    runner
        .exec(&format!(
            "tar -czf {} -C {} {} && rm -rf {}/{}",
            archive,
            base,
            shell_quote(dir_name),
            base,
            shell_quote(dir_name)
        ))
        .map_err(|e| RunnerError::Retrieval(format!("cannot compress {}: {}", source_dir, e)))?;

    let dest = target_dir.join(archive_name(test_name, variant));
    runner
        .executor()
        .fetch(&archive, &dest)
        .map_err(|e| RunnerError::Retrieval(format!("cannot fetch {}: {}", archive, e)))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalShell;
    use bench_core::ProfilingOp;
    use chrono::Utc;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    fn scratch(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bench_retrieve_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn variant() -> ProfilingVariant {
        ProfilingVariant {
            operation: ProfilingOp::Doctor,
            file_set: "One4MBFile".to_string(),
            command: "clinic doctor".to_string(),
        }
    }

    #[test]
    fn profiler_directory_is_archived_and_fetched() {
        let root = scratch("ok");
        let out = root.join("out");
        let clinic_dir = out.join("localTransfer").join("4242.clinic-doctor");
        fs::create_dir_all(&clinic_dir).expect("clinic dir");
        fs::write(clinic_dir.join("data.json"), b"{}").expect("write");
        let runner = CommandRunner::new(
            Arc::new(LocalShell::new(Duration::from_secs(30))),
            out.to_string_lossy().to_string(),
        );
        let target = root.join("run").join("localTransfer");

        let dest = retrieve(&runner, "localTransfer", &variant(), &target).expect("retrieve");
        assert_eq!(
            dest,
            target.join("localTransfer-doctor-One4MBFile.tar.gz")
        );
        assert!(dest.exists());
        assert!(!clinic_dir.exists(), "uncompressed output must be removed");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_output_directory_is_an_error() {
        let root = scratch("missing");
        let out = root.join("out");
        fs::create_dir_all(out.join("localTransfer")).expect("dir");
        let runner = CommandRunner::new(
            Arc::new(LocalShell::new(Duration::from_secs(30))),
            out.to_string_lossy().to_string(),
        );
        let err = retrieve(&runner, "localTransfer", &variant(), &root.join("run"))
            .expect_err("nothing to retrieve");
        assert!(matches!(err, RunnerError::Retrieval(_)), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
