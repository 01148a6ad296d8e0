use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::config::{ArchiveProtocol, ArchiveSettings};
use crate::error::CsdmError;
use crate::fs_util;
use crate::sftp::SftpArchiveClient;
use crate::timeutil::DateRange;

pub trait RemoteArchive: Send + Sync {
    /// Directories whose name contains `name`, shallowest matches first.
    fn search_sub_dir(&self, name: &str) -> Result<Vec<String>, CsdmError>;
    /// Every file below `dir`, recursively.
    fn file_list(&self, dir: &str) -> Result<Vec<String>, CsdmError>;
    /// Copies one remote file into `local_dir` and returns the bytes written.
    fn fetch_file(&self, remote_path: &str, local_dir: &Path) -> Result<u64, CsdmError>;

    fn list_range(&self, dir: &str, range: &DateRange) -> Result<Vec<String>, CsdmError> {
        Ok(self
            .file_list(dir)?
            .into_iter()
            .filter(|path| range.contains_path(path))
            .collect())
    }
}

pub fn join_remote(dir: &str, name: &str) -> String {
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

pub fn remote_file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Extracts child entries from an autoindex HTML page.
pub fn parse_index(html: &str) -> Vec<IndexEntry> {
    static HREF: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(href) = HREF
        .get_or_init(|| Regex::new(r#"(?i)href\s*=\s*"([^"]+)""#).ok())
        .as_ref()
    else {
        return Vec::new();
    };

    let mut seen = std::collections::BTreeSet::new();
    let mut entries = Vec::new();
    for capture in href.captures_iter(html) {
        let target = &capture[1];
        if target.starts_with('?')
            || target.starts_with('/')
            || target.starts_with('#')
            || target.starts_with("..")
            || target.contains("://")
        {
            continue;
        }
        let is_dir = target.ends_with('/');
        let name = target.trim_end_matches('/').to_string();
        if name.is_empty() || name.contains('/') || !seen.insert(name.clone()) {
            continue;
        }
        entries.push(IndexEntry { name, is_dir });
    }
    entries
}

#[derive(Clone)]
pub struct HttpArchiveClient {
    client: Client,
    base_url: String,
    max_search_depth: usize,
    credentials: Option<(String, String)>,
}

impl HttpArchiveClient {
    pub fn new(settings: &ArchiveSettings) -> Result<Self, CsdmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("csdm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CsdmError::ArchiveHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| CsdmError::ArchiveHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_search_depth: settings.max_search_depth,
            credentials: archive_credentials(settings.username.as_deref()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let request = self.client.get(url);
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    fn list_dir(&self, dir: &str) -> Result<Vec<IndexEntry>, CsdmError> {
        let url = format!("{}/", self.url(dir).trim_end_matches('/'));
        let response = self.send_with_retries(|| self.request(&url))?;
        let response = Self::handle_status(response)?;
        let html = response
            .text()
            .map_err(|err| CsdmError::ArchiveHttp(err.to_string()))?;
        Ok(parse_index(&html))
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, CsdmError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "remote archive request failed".to_string());
        Err(CsdmError::ArchiveStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, CsdmError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(CsdmError::ArchiveHttp(err.to_string()));
                }
            }
        }
    }
}

impl RemoteArchive for HttpArchiveClient {
    fn search_sub_dir(&self, name: &str) -> Result<Vec<String>, CsdmError> {
        let mut level = vec!["/".to_string()];
        for _ in 0..self.max_search_depth {
            let mut matches = Vec::new();
            let mut next = Vec::new();
            for dir in &level {
                for entry in self.list_dir(dir)?.into_iter().filter(|entry| entry.is_dir) {
                    let path = join_remote(dir, &entry.name);
                    if entry.name.contains(name) {
                        matches.push(path);
                    } else {
                        next.push(path);
                    }
                }
            }
            if !matches.is_empty() {
                return Ok(matches);
            }
            if next.is_empty() {
                break;
            }
            level = next;
        }
        Ok(Vec::new())
    }

    fn file_list(&self, dir: &str) -> Result<Vec<String>, CsdmError> {
        let mut files = Vec::new();
        let mut pending = VecDeque::from([dir.to_string()]);
        while let Some(current) = pending.pop_front() {
            for entry in self.list_dir(&current)? {
                let path = join_remote(&current, &entry.name);
                if entry.is_dir {
                    pending.push_back(path);
                } else {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn list_range(&self, dir: &str, range: &DateRange) -> Result<Vec<String>, CsdmError> {
        let mut files = Vec::new();
        for day in range.day_dirs() {
            match self.file_list(&join_remote(dir, &day)) {
                Ok(listed) => files.extend(listed),
                Err(CsdmError::ArchiveStatus { status, .. })
                    if status == StatusCode::NOT_FOUND.as_u16() =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(files)
    }

    fn fetch_file(&self, remote_path: &str, local_dir: &Path) -> Result<u64, CsdmError> {
        let transfer_error = |message: String| CsdmError::TransferFailure {
            path: remote_path.to_string(),
            message,
        };
        let url = self.url(remote_path);
        let mut response = self
            .send_with_retries(|| self.request(&url))
            .map_err(|err| transfer_error(err.to_string()))?;
        if !response.status().is_success() {
            return Err(transfer_error(format!("status {}", response.status().as_u16())));
        }

        fs::create_dir_all(local_dir).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        let name = remote_file_name(remote_path);
        let partial = local_dir.join(format!("{name}.part"));
        let mut file =
            File::create(&partial).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        let bytes = std::io::copy(&mut response, &mut file).map_err(|err| {
            let _ = fs::remove_file(&partial);
            transfer_error(err.to_string())
        })?;
        fs::rename(&partial, local_dir.join(name))
            .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        Ok(bytes)
    }
}

/// The archive transport selected by `archive.protocol`.
pub enum ArchiveClient {
    Sftp(SftpArchiveClient),
    Http(HttpArchiveClient),
}

impl ArchiveClient {
    pub fn connect(settings: &ArchiveSettings) -> Result<Self, CsdmError> {
        Ok(match settings.protocol {
            ArchiveProtocol::Sftp => Self::Sftp(SftpArchiveClient::new(settings)?),
            ArchiveProtocol::Http => Self::Http(HttpArchiveClient::new(settings)?),
        })
    }

    fn remote(&self) -> &dyn RemoteArchive {
        match self {
            Self::Sftp(client) => client,
            Self::Http(client) => client,
        }
    }
}

impl RemoteArchive for ArchiveClient {
    fn search_sub_dir(&self, name: &str) -> Result<Vec<String>, CsdmError> {
        self.remote().search_sub_dir(name)
    }

    fn file_list(&self, dir: &str) -> Result<Vec<String>, CsdmError> {
        self.remote().file_list(dir)
    }

    fn list_range(&self, dir: &str, range: &DateRange) -> Result<Vec<String>, CsdmError> {
        self.remote().list_range(dir, range)
    }

    fn fetch_file(&self, remote_path: &str, local_dir: &Path) -> Result<u64, CsdmError> {
        self.remote().fetch_file(remote_path, local_dir)
    }
}

pub(crate) fn archive_credentials(username: Option<&str>) -> Option<(String, String)> {
    let user = username
        .map(str::to_string)
        .or_else(|| std::env::var("CSDM_ARCHIVE_USER").ok())?;
    if user.trim().is_empty() {
        return None;
    }
    let password = std::env::var("CSDM_ARCHIVE_PASSWORD").unwrap_or_default();
    Some((user.trim().to_string(), password))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedListing {
    listed_at: DateTime<Utc>,
    files: Vec<String>,
}

impl CachedListing {
    fn is_fresh(&self, max_age: Option<Duration>) -> bool {
        let Some(max_age) = max_age else {
            return true;
        };
        Utc::now()
            .signed_duration_since(self.listed_at)
            .to_std()
            .map_or(true, |elapsed| elapsed < max_age)
    }
}

/// Listings keyed by the directory they were taken from.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ListingCache {
    entries: BTreeMap<String, CachedListing>,
}

impl ListingCache {
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs_util::read_json(path) {
            Ok(cache) => cache,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable listing cache");
                Self::default()
            }
        }
    }

    /// A listing cached for `dir` or for any ancestor of it, younger than `max_age`.
    pub fn lookup(&self, dir: &str, max_age: Option<Duration>) -> Option<Vec<String>> {
        let dir = dir.trim_end_matches('/');
        if let Some(listing) = self.entries.get(dir).filter(|listing| listing.is_fresh(max_age)) {
            return Some(listing.files.clone());
        }
        let prefix = format!("{dir}/");
        self.entries
            .iter()
            .filter(|(_, listing)| listing.is_fresh(max_age))
            .find(|(key, _)| dir.starts_with(&format!("{key}/")))
            .map(|(_, listing)| {
                listing
                    .files
                    .iter()
                    .filter(|file| file.starts_with(&prefix))
                    .cloned()
                    .collect()
            })
    }

    pub fn insert(&mut self, dir: &str, files: Vec<String>) {
        self.entries.insert(
            dir.trim_end_matches('/').to_string(),
            CachedListing {
                listed_at: Utc::now(),
                files,
            },
        );
    }
}

/// Serves directory listings from a local cache before asking the archive.
///
/// Entries older than the configured time to live are listed again; without
/// one they are kept until `refresh` replaces them.
pub struct CachedArchive<A> {
    inner: A,
    path: PathBuf,
    ttl: Option<Duration>,
    cache: Mutex<ListingCache>,
}

impl<A: RemoteArchive> CachedArchive<A> {
    pub fn new(inner: A, path: &Path) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            ttl: None,
            cache: Mutex::new(ListingCache::load(path)),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Re-lists `dir` from the archive, replacing whatever was cached for it.
    pub fn refresh(&self, dir: &str) -> Result<Vec<String>, CsdmError> {
        let files = self.inner.file_list(dir)?;
        self.store(|cache| cache.insert(dir, files.clone()))?;
        Ok(files)
    }

    fn lookup(&self, dir: &str) -> Result<Option<Vec<String>>, CsdmError> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| CsdmError::Filesystem("listing cache lock poisoned".to_string()))?;
        Ok(cache.lookup(dir, self.ttl))
    }

    fn store(&self, change: impl FnOnce(&mut ListingCache)) -> Result<(), CsdmError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| CsdmError::Filesystem("listing cache lock poisoned".to_string()))?;
        change(&mut cache);
        fs_util::write_json_atomic(&self.path, &*cache)
    }
}

impl<A: RemoteArchive> RemoteArchive for CachedArchive<A> {
    fn search_sub_dir(&self, name: &str) -> Result<Vec<String>, CsdmError> {
        self.inner.search_sub_dir(name)
    }

    fn file_list(&self, dir: &str) -> Result<Vec<String>, CsdmError> {
        if let Some(files) = self.lookup(dir)?.filter(|files| !files.is_empty()) {
            return Ok(files);
        }
        self.refresh(dir)
    }

    fn list_range(&self, dir: &str, range: &DateRange) -> Result<Vec<String>, CsdmError> {
        if let Some(files) = self.lookup(dir)?.filter(|files| !files.is_empty()) {
            return Ok(files
                .into_iter()
                .filter(|path| range.contains_path(path))
                .collect());
        }

        let days = range
            .day_dirs()
            .into_iter()
            .map(|day| join_remote(dir, &day))
            .collect::<Vec<_>>();
        let mut cached = Vec::new();
        let mut complete = true;
        for day in &days {
            match self.lookup(day)?.filter(|files| !files.is_empty()) {
                Some(files) => cached.extend(files),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            return Ok(cached);
        }

        let files = self.inner.list_range(dir, range)?;
        self.store(|cache| {
            for day in &days {
                let prefix = format!("{day}/");
                let listed = files
                    .iter()
                    .filter(|file| file.starts_with(&prefix))
                    .cloned()
                    .collect::<Vec<_>>();
                if !listed.is_empty() {
                    cache.insert(day, listed);
                }
            }
        })?;
        Ok(files)
    }

    fn fetch_file(&self, remote_path: &str, local_dir: &Path) -> Result<u64, CsdmError> {
        self.inner.fetch_file(remote_path, local_dir)
    }
}
