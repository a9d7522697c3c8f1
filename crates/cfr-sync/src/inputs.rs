//! Store list and processing-date loaders.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use cfr_core::{ProcessingDate, Store};
use chrono::NaiveTime;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("no stores defined in {}", .0.display())]
    NoStores(PathBuf),
    #[error("no processing dates in {}", .0.display())]
    NoDates(PathBuf),
}

#[derive(Debug, Deserialize)]
struct StoreFile {
    #[serde(default)]
    stores: Vec<StoreEntry>,
}

#[derive(Debug, Deserialize)]
struct StoreEntry {
    name: String,
    #[serde(default)]
    works_by_shift: Flag,
    start: String,
    end: String,
    #[serde(default = "Flag::yes")]
    active: Flag,
}

/// Sheet-style `S`/`N` flag or a plain YAML boolean.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Default for Flag {
    fn default() -> Self {
        Flag::Bool(false)
    }
}

impl Flag {
    fn yes() -> Self {
        Flag::Bool(true)
    }

    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(value) => *value,
            Flag::Text(text) => matches!(
                text.trim().to_ascii_uppercase().as_str(),
                "S" | "SIM" | "Y" | "YES" | "TRUE" | "1"
            ),
        }
    }
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
}

pub fn parse_stores(text: &str, path: &Path) -> Result<Vec<Store>, LoadError> {
    let file: StoreFile = serde_yaml::from_str(text).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut seen = HashSet::new();
    let mut stores = Vec::with_capacity(file.stores.len());
    for entry in file.stores {
        let name = entry.name.trim().to_string();
        if name.is_empty() {
            warn!("skipping store entry without a name");
            continue;
        }
        let (Some(start_time), Some(end_time)) = (parse_time(&entry.start), parse_time(&entry.end))
        else {
            warn!(store = %name, start = %entry.start, end = %entry.end, "skipping store with unreadable schedule");
            continue;
        };
        if !seen.insert(name.clone()) {
            warn!(store = %name, "skipping duplicate store entry");
            continue;
        }
        stores.push(Store {
            name,
            works_by_shift: entry.works_by_shift.is_set(),
            start_time,
            end_time,
            active: entry.active.is_set(),
        });
    }

    if stores.is_empty() {
        return Err(LoadError::NoStores(path.to_path_buf()));
    }
    Ok(stores)
}

pub fn parse_dates(text: &str, path: &Path) -> Result<Vec<ProcessingDate>, LoadError> {
    let mut dates = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match ProcessingDate::parse(line) {
            Some(date) => dates.push(date),
            None => warn!(line = idx + 1, value = %line, "skipping malformed date"),
        }
    }
    if dates.is_empty() {
        return Err(LoadError::NoDates(path.to_path_buf()));
    }
    Ok(dates)
}

async fn read(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).await.map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub async fn load_stores(path: &Path) -> Result<Vec<Store>, LoadError> {
    let stores = parse_stores(&read(path).await?, path)?;
    let active = stores.iter().filter(|s| s.active).count();
    info!(path = %path.display(), stores = stores.len(), active, "loaded stores");
    Ok(stores)
}

pub async fn load_dates(path: &Path) -> Result<Vec<ProcessingDate>, LoadError> {
    let dates = parse_dates(&read(path).await?, path)?;
    info!(path = %path.display(), dates = dates.len(), "loaded processing dates");
    Ok(dates)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORES: &str = r#"
stores:
  - name: " Loja Centro "
    works_by_shift: "S"
    start: "18:00"
    end: "02:00"
    active: "S"
  - name: Loja Norte
    works_by_shift: false
    start: "06:00:00"
    end: "23:59:00"
    active: true
  - name: Loja Quebrada
    start: "25h"
    end: "02:00"
  - name: Loja Fechada
    works_by_shift: "N"
    start: "10:00"
    end: "22:00"
    active: "N"
  - name: Loja Centro
    start: "10:00"
    end: "22:00"
"#;

    #[test]
    fn store_flags_and_times_are_normalized() {
        let stores = parse_stores(STORES, Path::new("stores.yaml")).unwrap();
        let names = stores.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Loja Centro", "Loja Norte", "Loja Fechada"]);
        assert!(stores[0].works_by_shift && stores[0].active);
        assert_eq!(stores[0].start_label(), "18:00");
        assert_eq!(stores[1].end_label(), "23:59");
        assert!(!stores[1].works_by_shift && stores[1].active);
        assert!(!stores[2].active);
    }

    #[test]
    fn empty_store_list_is_fatal() {
        let err = parse_stores("stores: []\n", Path::new("stores.yaml")).unwrap_err();
        assert!(matches!(err, LoadError::NoStores(_)));
        let err = parse_stores("stores: [oops", Path::new("stores.yaml")).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    fn dates_skip_blank_and_malformed_lines() {
        let dates = parse_dates("14/10/2025\n\n31/02/2025\n 15/10/2025 \n", Path::new("d.txt")).unwrap();
        let shown = dates.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(shown, vec!["14/10/2025", "15/10/2025"]);
        assert!(matches!(
            parse_dates("\n", Path::new("d.txt")),
            Err(LoadError::NoDates(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dates(&dir.path().join("absent.txt")).await.unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }
}
