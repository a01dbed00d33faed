//! CSV input loading for companies and their candidate URLs.

use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Trim};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::models::{Company, SourceType, SourceUrl};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column '{0}'")]
    MissingColumn(&'static str),
}

/// Column positions resolved from a header row.
struct Columns<'a> {
    headers: &'a StringRecord,
}

impl<'a> Columns<'a> {
    fn require(&self, name: &'static str) -> Result<usize, LoadError> {
        self.find(name).ok_or(LoadError::MissingColumn(name))
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    }
}

fn cell(row: &StringRecord, idx: Option<usize>) -> &str {
    idx.and_then(|i| row.get(i)).map(str::trim).unwrap_or("")
}

fn read_file(path: &Path) -> Result<String, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(strip_bom(&content).to_string())
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}

fn reader<R: std::io::Read>(input: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(input)
}

/// Parse `id,name` rows. Rows with a non-integer id or an empty name are skipped.
pub fn read_companies<R: std::io::Read>(input: R) -> Result<Vec<Company>, LoadError> {
    let mut reader = reader(input);
    let headers = reader.headers()?.clone();
    let columns = Columns { headers: &headers };
    let id_col = columns.require("id")?;
    let name_col = columns.require("name")?;

    let mut companies = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        let line = idx + 2;
        let raw_id = cell(&row, Some(id_col));
        let Ok(id) = raw_id.parse::<i64>() else {
            warn!(line, id = raw_id, "Skipping company row with invalid id");
            continue;
        };
        let name = cell(&row, Some(name_col));
        if name.is_empty() {
            warn!(line, id, "Skipping company row with empty name");
            continue;
        }
        companies.push(Company::new(id, name));
    }
    Ok(companies)
}

/// Parse `company_id,url,source_type,priority` rows.
///
/// Rows without a usable company id or URL are skipped. A missing or non-integer
/// priority becomes the default priority and an unknown source type becomes `other`.
pub fn read_urls<R: std::io::Read>(input: R) -> Result<Vec<SourceUrl>, LoadError> {
    let mut reader = reader(input);
    let headers = reader.headers()?.clone();
    let columns = Columns { headers: &headers };
    let company_col = columns.require("company_id")?;
    let url_col = columns.require("url")?;
    let type_col = columns.find("source_type");
    let priority_col = columns.find("priority");

    let mut urls = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        let line = idx + 2;
        let raw_company = cell(&row, Some(company_col));
        let Ok(company_id) = raw_company.parse::<i64>() else {
            warn!(line, company_id = raw_company, "Skipping url row with invalid company id");
            continue;
        };

        let raw_url = cell(&row, Some(url_col));
        if raw_url.is_empty() {
            warn!(line, company_id, "Skipping url row with empty url");
            continue;
        }
        if let Err(e) = Url::parse(raw_url) {
            warn!(line, url = raw_url, error = %e, "Skipping invalid url");
            continue;
        }

        let raw_type = cell(&row, type_col);
        let source_type = SourceType::from_str(raw_type).unwrap_or_else(|| {
            if !raw_type.is_empty() {
                warn!(line, source_type = raw_type, "Unknown source type, using 'other'");
            }
            SourceType::Other
        });
        let priority = cell(&row, priority_col).parse::<i64>().ok();

        urls.push(SourceUrl::new(company_id, raw_url, source_type, priority));
    }
    Ok(urls)
}

/// Load companies from a CSV file.
pub fn load_companies(path: &Path) -> Result<Vec<Company>, LoadError> {
    let content = read_file(path)?;
    let companies = read_companies(content.as_bytes())?;
    info!(path = %path.display(), count = companies.len(), "Loaded companies");
    Ok(companies)
}

/// Load candidate URLs from a CSV file.
pub fn load_urls(path: &Path) -> Result<Vec<SourceUrl>, LoadError> {
    let content = read_file(path)?;
    let urls = read_urls(content.as_bytes())?;
    info!(path = %path.display(), count = urls.len(), "Loaded source urls");
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_PRIORITY;
    use std::io::Write;

    #[test]
    fn test_read_companies_skips_invalid_rows() {
        let csv = "id,name\n1, Acme Corp \nabc,Broken\n3,\n4,株式会社テスト\n";
        let companies = read_companies(csv.as_bytes()).unwrap();
        assert_eq!(
            companies,
            vec![Company::new(1, "Acme Corp"), Company::new(4, "株式会社テスト")]
        );
    }

    #[test]
    fn test_read_urls_defaults() {
        let csv = "company_id,url,source_type,priority\n\
                   1,https://acme.example/about,official,1\n\
                   1,https://acme.example/ir,IR,\n\
                   1,https://blog.example/acme,blog,x\n\
                   2,not a url,official,1\n\
                   x,https://acme.example/,official,1\n\
                   1,,official,1\n";
        let urls = read_urls(csv.as_bytes()).unwrap();
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0].priority, 1);
        assert_eq!(urls[0].source_type, SourceType::Official);
        assert_eq!(urls[1].source_type, SourceType::Ir);
        assert_eq!(urls[1].priority, DEFAULT_PRIORITY);
        assert_eq!(urls[2].source_type, SourceType::Other);
        assert_eq!(urls[2].priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_missing_column() {
        let err = read_urls("company_id,link\n1,https://a.example\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LoadError::MissingColumn("url")));
    }

    #[test]
    fn test_load_companies_strips_bom() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all("\u{feff}id,name\n7,Globex\n".as_bytes()).unwrap();
        let companies = load_companies(file.path()).unwrap();
        assert_eq!(companies, vec![Company::new(7, "Globex")]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_companies(Path::new("/nonexistent/companies.csv")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
