use std::collections::VecDeque;
use std::fs::{self, File};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Mutex;

use ssh2::{ErrorCode, Session, Sftp};

use crate::archive::{RemoteArchive, archive_credentials, join_remote, remote_file_name};
use crate::config::ArchiveSettings;
use crate::error::CsdmError;
use crate::timeutil::DateRange;

const NO_SUCH_FILE: i32 = 2;

struct Connection {
    // Keeps the transport open for as long as the channel is used.
    _session: Session,
    sftp: Sftp,
}

/// The CloudSat archive over SFTP.
///
/// The session is opened on first use and dropped after any failed call, so
/// the next call reconnects.
pub struct SftpArchiveClient {
    host: String,
    port: u16,
    timeout_ms: u32,
    max_search_depth: usize,
    credentials: (String, String),
    connection: Mutex<Option<Connection>>,
}

impl SftpArchiveClient {
    pub fn new(settings: &ArchiveSettings) -> Result<Self, CsdmError> {
        let credentials = archive_credentials(settings.username.as_deref()).ok_or_else(|| {
            CsdmError::ArchiveSession(
                "an archive username is required (set archive.username or CSDM_ARCHIVE_USER)"
                    .to_string(),
            )
        })?;
        Ok(Self {
            host: settings.host.clone(),
            port: settings.port,
            timeout_ms: u32::try_from(settings.timeout_secs.saturating_mul(1_000))
                .unwrap_or(u32::MAX),
            max_search_depth: settings.max_search_depth,
            credentials,
            connection: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&self) -> Result<Connection, CsdmError> {
        let session_error = |err: ssh2::Error| CsdmError::ArchiveSession(err.to_string());
        let tcp = TcpStream::connect(self.endpoint())
            .map_err(|err| CsdmError::ArchiveSession(format!("{}: {err}", self.endpoint())))?;
        let mut session = Session::new().map_err(session_error)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout_ms);
        session.handshake().map_err(session_error)?;

        let (user, password) = &self.credentials;
        if password.is_empty() {
            session.userauth_agent(user).map_err(session_error)?;
        } else {
            session.userauth_password(user, password).map_err(session_error)?;
        }
        if !session.authenticated() {
            return Err(CsdmError::ArchiveSession(format!(
                "authentication as {user} was rejected"
            )));
        }

        let sftp = session.sftp().map_err(session_error)?;
        tracing::info!(endpoint = %self.endpoint(), user = %user, "archive session opened");
        Ok(Connection {
            _session: session,
            sftp,
        })
    }

    fn with_sftp<T>(
        &self,
        action: impl FnOnce(&Sftp) -> Result<T, ssh2::Error>,
    ) -> Result<T, SftpFailure> {
        let mut guard = self.connection.lock().map_err(|_| {
            SftpFailure::Session(CsdmError::ArchiveSession("session lock poisoned".to_string()))
        })?;
        if guard.is_none() {
            *guard = Some(self.connect().map_err(SftpFailure::Session)?);
        }
        let Some(connection) = guard.as_ref() else {
            return Err(SftpFailure::Session(CsdmError::ArchiveSession(
                "no archive session".to_string(),
            )));
        };
        match action(&connection.sftp) {
            Ok(value) => Ok(value),
            Err(err) if is_missing(&err) => Err(SftpFailure::Missing),
            Err(err) => {
                *guard = None;
                Err(SftpFailure::Session(CsdmError::ArchiveSession(err.to_string())))
            }
        }
    }

    fn disconnect(&self) {
        if let Ok(mut guard) = self.connection.lock() {
            *guard = None;
        }
    }

    fn list_dir(&self, dir: &str) -> Result<Vec<(String, bool)>, SftpFailure> {
        let entries = self.with_sftp(|sftp| sftp.readdir(Path::new(dir)))?;
        let mut listed = entries
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_str()?.to_string();
                Some((join_remote(dir, &name), stat.is_dir()))
            })
            .collect::<Vec<_>>();
        listed.sort();
        Ok(listed)
    }

    fn walk(&self, dir: &str) -> Result<Vec<String>, SftpFailure> {
        let mut files = Vec::new();
        let mut pending = VecDeque::from([dir.to_string()]);
        while let Some(current) = pending.pop_front() {
            for (path, is_dir) in self.list_dir(&current)? {
                if is_dir {
                    pending.push_back(path);
                } else {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

enum SftpFailure {
    Missing,
    Session(CsdmError),
}

impl SftpFailure {
    fn into_error(self, path: &str) -> CsdmError {
        match self {
            SftpFailure::Missing => CsdmError::ArchiveStatus {
                status: 404,
                message: format!("{path} does not exist on the archive"),
            },
            SftpFailure::Session(err) => err,
        }
    }
}

fn is_missing(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(NO_SUCH_FILE))
}

impl RemoteArchive for SftpArchiveClient {
    fn search_sub_dir(&self, name: &str) -> Result<Vec<String>, CsdmError> {
        let mut level = vec!["/".to_string()];
        for _ in 0..self.max_search_depth {
            let mut matches = Vec::new();
            let mut next = Vec::new();
            for dir in &level {
                let entries = self.list_dir(dir).map_err(|failure| failure.into_error(dir))?;
                for (path, _) in entries.into_iter().filter(|(_, is_dir)| *is_dir) {
                    if remote_file_name(&path).contains(name) {
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
        self.walk(dir).map_err(|failure| failure.into_error(dir))
    }

    fn list_range(&self, dir: &str, range: &DateRange) -> Result<Vec<String>, CsdmError> {
        let mut files = Vec::new();
        for day in range.day_dirs() {
            let day_dir = join_remote(dir, &day);
            match self.walk(&day_dir) {
                Ok(listed) => files.extend(listed),
                Err(SftpFailure::Missing) => continue,
                Err(failure) => return Err(failure.into_error(&day_dir)),
            }
        }
        Ok(files)
    }

    fn fetch_file(&self, remote_path: &str, local_dir: &Path) -> Result<u64, CsdmError> {
        let transfer_error = |message: String| CsdmError::TransferFailure {
            path: remote_path.to_string(),
            message,
        };
        fs::create_dir_all(local_dir).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        let name = remote_file_name(remote_path);
        let partial = local_dir.join(format!("{name}.part"));

        let mut remote = self
            .with_sftp(|sftp| sftp.open(Path::new(remote_path)))
            .map_err(|failure| transfer_error(failure.into_error(remote_path).to_string()))?;
        let mut file =
            File::create(&partial).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        let bytes = std::io::copy(&mut remote, &mut file).map_err(|err| {
            let _ = fs::remove_file(&partial);
            self.disconnect();
            transfer_error(err.to_string())
        })?;
        fs::rename(&partial, local_dir.join(name))
            .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        Ok(bytes)
    }
}
