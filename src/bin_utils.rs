use crate::estimator::EstimatorKind;
use csv::Writer;
use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub fn write_records(output: &Path, records: Vec<impl Serialize>) -> csv::Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut writer = Writer::from_path(output)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn parse_comma_range_num_list(
    s: &str,
) -> Result<Vec<usize>, <usize as std::str::FromStr>::Err> {
    use either::Either;
    Ok(s.split(',')
        .map(|val| {
            if let Some((beg, end)) = val.split_once('-') {
                let beg: usize = beg.parse()?;
                let end: usize = end.parse()?;
                Ok(Either::Left(beg..(end + 1)))
            } else {
                let num: usize = val.parse()?;
                Ok(Either::Right(std::iter::once(num)))
            }
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .sorted_unstable()
        .collect())
}

pub fn parse_comma_estimator_list(s: &str) -> Result<Vec<EstimatorKind>, strum::ParseError> {
    s.split(',').map(EstimatorKind::from_str).collect()
}

pub fn default_estimators() -> Vec<EstimatorKind> {
    vec![EstimatorKind::Planner, EstimatorKind::True]
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("output")
}

pub fn default_queries_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("queries")
}

/// The `*.sql` files of `dir` sorted by name, as (file stem, contents). `selection` picks files
/// by their 1-based position.
pub fn read_queries(dir: &Path, selection: Option<&[usize]>) -> io::Result<Vec<(String, String)>> {
    let paths: Vec<PathBuf> = dir
        .read_dir()?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|path| path.extension().map_or(false, |ext| ext == "sql"))
        .sorted()
        .collect();

    paths
        .iter()
        .enumerate()
        .filter(|(idx, _)| selection.map_or(true, |selection| selection.contains(&(idx + 1))))
        .map(|(_, path)| {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok((name, fs::read_to_string(path)?))
        })
        .collect()
}

pub fn hostname() -> String {
    let name = gethostname::gethostname();
    let name = name.to_string_lossy();
    name.strip_prefix('"')
        .and_then(|name| name.strip_suffix('"'))
        .unwrap_or(&*name)
        .to_string()
}

/// Sends log output to stderr. Only binaries call this.
pub fn init_logging(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(io::stderr())
        .apply()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Serialize)]
    struct Row {
        query: String,
        runtime_secs: Option<f64>,
    }

    #[test]
    fn test_parse_comma_range_num_list() {
        assert_eq!(parse_comma_range_num_list("5,1-3").unwrap(), vec![1, 2, 3, 5]);
        assert!(parse_comma_range_num_list("1-x").is_err());
        assert_eq!(
            parse_comma_estimator_list("planner,true").unwrap(),
            vec![EstimatorKind::Planner, EstimatorKind::True]
        );
        assert!(parse_comma_estimator_list("oracle").is_err());
    }

    #[test]
    fn test_read_queries_and_write_records() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2a.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("1a.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        assert_eq!(
            read_queries(dir.path(), None).unwrap(),
            vec![
                ("1a".to_string(), "SELECT 1;".to_string()),
                ("2a".to_string(), "SELECT 2;".to_string())
            ]
        );
        assert_eq!(read_queries(dir.path(), Some(&[2])).unwrap().len(), 1);

        let output = dir.path().join("out").join("records.csv");
        write_records(
            &output,
            vec![
                Row {
                    query: "1a".to_string(),
                    runtime_secs: Some(0.5),
                },
                Row {
                    query: "2a".to_string(),
                    runtime_secs: None,
                },
            ],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "query,runtime_secs\n1a,0.5\n2a,\n"
        );
    }
}
