//! Archiving of per-run output artefacts.

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::RunnerError;

/// Write a gzip'd tar of `<outputs>/<plan>/<run_id>/` to `writer`.
///
/// Entry paths inside the archive are rooted at `<plan>/<run_id>/`, so an
/// archive extracts into the same layout the runner produced.
pub fn collect_outputs<W: Write>(
    outputs_dir: &Path,
    plan: &str,
    run_id: &str,
    writer: W,
) -> Result<(), RunnerError> {
    let run_dir = outputs_dir.join(plan).join(run_id);
    if !run_dir.is_dir() {
        return Err(RunnerError::InvalidInput(format!(
            "no outputs recorded for run {run_id} of plan {plan}"
        )));
    }

    let encoder = GzEncoder::new(writer, Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive
        .append_dir_all(Path::new(plan).join(run_id), &run_dir)
        .map_err(|e| RunnerError::io(&run_dir, e))?;
    archive
        .into_inner()
        .map_err(|e| RunnerError::io(&run_dir, e))?
        .finish()
        .map_err(|e| RunnerError::io(&run_dir, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::Read;

    use flate2::read::GzDecoder;
    use tar::Archive;

    fn write_file(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn archives_only_the_requested_run() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = dir.path();
        write_file(&outputs.join("dht/run-1/g1/0/out.log"), "hello");
        write_file(&outputs.join("dht/run-1/g1/1/out.log"), "world");
        write_file(&outputs.join("dht/run-2/g1/0/out.log"), "other run");

        let mut buf = Vec::new();
        collect_outputs(outputs, "dht", "run-1", &mut buf).unwrap();

        let mut archive = Archive::new(GzDecoder::new(buf.as_slice()));
        let mut paths = BTreeSet::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            paths.insert(entry.path().unwrap().to_string_lossy().into_owned());
        }
        assert!(paths.contains("dht/run-1/g1/0/out.log"));
        assert!(paths.contains("dht/run-1/g1/1/out.log"));
        assert!(!paths.iter().any(|p| p.contains("run-2")));
    }

    #[test]
    fn archive_round_trips_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("p/r/g/0/result.json"), "{\"ok\":true}");

        let mut buf = Vec::new();
        collect_outputs(dir.path(), "p", "r", &mut buf).unwrap();

        let mut archive = Archive::new(GzDecoder::new(buf.as_slice()));
        let mut contents = String::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().ends_with("result.json") {
                entry.read_to_string(&mut contents).unwrap();
            }
        }
        assert_eq!(contents, "{\"ok\":true}");
    }

    #[test]
    fn unknown_run_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Vec::new();
        let err = collect_outputs(dir.path(), "dht", "nope", &mut buf).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidInput(_)));
    }
}
