use crate::{common::*, config::LoadCheckpoint};

/// Time format of the per-run logging directory names.
pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

/// Sub-directory of a run directory holding the epoch checkpoints.
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Name of a new run directory, the current local time.
pub fn run_dir_name() -> String {
    Local::now().format(FILE_STRFTIME).to_string()
}

/// Finds the checkpoint file to resume from with the specified loading
/// method.
///
/// The most recent checkpoint is the one with the largest epoch number in the
/// most recent run directory under `logging_dir`.
pub fn resolve_checkpoint(
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let checkpoint_filename_regex = Regex::new(r"^ep(\d{3,})-loss.*\.ckpt$")?;
            let pattern = format!(
                "{}/*/{}/*.ckpt",
                glob::Pattern::escape(&logging_dir.display().to_string()),
                CHECKPOINT_DIR
            );
            let paths: Vec<_> = glob::glob(&pattern)?.try_collect()?;

            let checkpoint_file = paths
                .into_iter()
                .filter_map(|path| {
                    let file_name = path.file_name()?.to_str()?;
                    let captures = checkpoint_filename_regex.captures(file_name)?;
                    let epoch: usize = captures.get(1)?.as_str().parse().ok()?;
                    let run_dir = path.parent()?.parent()?;
                    let run_name = run_dir.file_name()?.to_str()?;
                    let datetime = DateTime::parse_from_str(run_name, FILE_STRFTIME).ok()?;
                    Some(((datetime, epoch), path))
                })
                .max_by_key(|(key, _path)| *key)
                .map(|(_key, path)| path);

            if checkpoint_file.is_none() {
                warn!("no checkpoint file found in '{}'", logging_dir.display());
            }

            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            ensure!(file.is_file(), "'{}' is not a file", file.display());
            Some(file.to_owned())
        }
    };

    Ok(path)
}
