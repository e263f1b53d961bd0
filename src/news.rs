use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const ENTRY_MARKER: &str = "Title: ";

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct NewsEntry {
    pub title: String,
    pub description: String,
    pub date: String,
}

/// Happy-news picker over a plain-text file of entries:
///
/// ```text
/// Title: Otter adopts duckling
/// Description: An unlikely friendship at the city aquarium.
/// Date: 2024-05-01
/// ```
pub struct NewsService {
    path: PathBuf,
}

impl NewsService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File contents, creating an empty file first if needed. Empty on error.
    pub fn read_news_file(&self) -> String {
        match self.try_read() {
            Ok(data) => data,
            Err(err) => {
                log::error!("error reading news file: {:#}", err);
                String::new()
            }
        }
    }

    fn try_read(&self) -> Result<String> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("create {}", self.path.display()))?;
        std::fs::read_to_string(&self.path).with_context(|| format!("read {}", self.path.display()))
    }

    pub fn random_happy_news(&self) -> Option<NewsEntry> {
        let entries = self.entries()?;
        let entry = entries.choose(&mut rand::thread_rng())?.clone();
        log::info!("selected random news entry: {}", entry.title);
        Some(entry)
    }

    pub fn first_news_entry(&self) -> Option<NewsEntry> {
        let entry = self.entries()?.into_iter().next()?;
        log::info!("retrieved first news entry: {}", entry.title);
        Some(entry)
    }

    fn entries(&self) -> Option<Vec<NewsEntry>> {
        let data = self.read_news_file();
        if data.is_empty() {
            log::warn!("no news data available");
            return None;
        }
        let entries = parse_news_entries(&data);
        if entries.is_empty() {
            log::warn!("no valid news entries found");
            return None;
        }
        Some(entries)
    }
}

/// Splits `data` at every `Title: ` marker and keeps entries that carry a
/// title, description and date.
pub fn parse_news_entries(data: &str) -> Vec<NewsEntry> {
    let mut starts: Vec<usize> = data.match_indices(ENTRY_MARKER).map(|(i, _)| i).collect();
    if starts.first() != Some(&0) {
        starts.insert(0, 0);
    }
    starts.push(data.len());

    let entries: Vec<NewsEntry> = starts
        .windows(2)
        .map(|bounds| &data[bounds[0]..bounds[1]])
        .filter(|chunk| !chunk.trim().is_empty())
        .filter_map(parse_entry)
        .collect();
    log::info!("parsed {} news entries", entries.len());
    entries
}

fn parse_entry(chunk: &str) -> Option<NewsEntry> {
    static FIELDS: OnceLock<[regex::Regex; 3]> = OnceLock::new();
    let [title, description, date] = FIELDS.get_or_init(|| {
        ["Title", "Description", "Date"].map(|field| {
            regex::Regex::new(&format!(r"{}: ([^\n]*)", field)).expect("static news field regex")
        })
    });
    let field = |re: &regex::Regex| {
        re.captures(chunk)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    };
    Some(NewsEntry {
        title: field(title)?,
        description: field(description)?,
        date: field(date)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Title: Otter adopts duckling\n\
Description: An unlikely friendship at the aquarium.\n\
Date: 2024-05-01\n\
\n\
Title: Missing date entry\n\
Description: This one is skipped.\n\
Title: Town plants 10,000 trees  \n\
Description:   Volunteers finished a week early.\n\
Date: 2024-06-12\n";

    #[test]
    fn parses_complete_entries_only() {
        let entries = parse_news_entries(SAMPLE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Otter adopts duckling");
        assert_eq!(entries[1].title, "Town plants 10,000 trees");
        assert_eq!(entries[1].description, "Volunteers finished a week early.");
        assert_eq!(entries[1].date, "2024-06-12");
    }

    #[test]
    fn ignores_preamble_before_first_title() {
        let entries = parse_news_entries("happy news feed\n\nTitle: A\nDescription: B\nDate: C\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "A");
    }

    #[test]
    fn missing_file_is_created_and_yields_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let service = NewsService::new(dir.path().join("happy_news.txt"));
        assert_eq!(service.random_happy_news(), None);
        assert!(service.path().exists());
        Ok(())
    }

    #[test]
    fn picks_from_parsed_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("happy_news.txt");
        std::fs::write(&path, SAMPLE)?;
        let service = NewsService::new(path);

        let first = service.first_news_entry().expect("first entry");
        assert_eq!(first.title, "Otter adopts duckling");

        let random = service.random_happy_news().expect("random entry");
        assert!(parse_news_entries(SAMPLE).contains(&random));
        Ok(())
    }
}
