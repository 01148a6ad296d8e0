use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::DecoderSettings;
use crate::error::CsdmError;

/// Turns raw granules into rows of the storage target.
///
/// Implementations must upsert: a batch may be decoded more than once when a
/// previous attempt failed part way.
pub trait Decoder: Send + Sync {
    fn decode(
        &self,
        files: &[PathBuf],
        field_names: &[String],
        key_columns: &[String],
        target: &Path,
    ) -> Result<(), CsdmError>;
}

#[derive(Debug)]
pub struct CommandDecoder {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandDecoder {
    pub fn new(settings: &DecoderSettings) -> Result<Self, CsdmError> {
        let program = resolve_program(&settings.program)
            .ok_or_else(|| CsdmError::MissingTool(settings.program.clone()))?;
        Ok(Self {
            program,
            args: settings.args.clone(),
        })
    }

    fn command_args(
        &self,
        files: &[PathBuf],
        field_names: &[String],
        key_columns: &[String],
        target: &Path,
    ) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--fields".to_string());
        args.push(field_names.join(","));
        args.push("--keys".to_string());
        args.push(key_columns.join(","));
        args.push("--target".to_string());
        args.push(target.display().to_string());
        args.extend(files.iter().map(|file| file.display().to_string()));
        args
    }
}

impl Decoder for CommandDecoder {
    fn decode(
        &self,
        files: &[PathBuf],
        field_names: &[String],
        key_columns: &[String],
        target: &Path,
    ) -> Result<(), CsdmError> {
        let args = self.command_args(files, field_names, key_columns, target);
        tracing::debug!(program = %self.program.display(), files = files.len(), "running decoder");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|err| CsdmError::DecodeFailure(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )
        } else {
            stderr
        };
        Err(CsdmError::DecodeFailure(message))
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(program);
    if direct.components().count() > 1 {
        return direct.exists().then_some(direct);
    }
    find_in_path(program)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
