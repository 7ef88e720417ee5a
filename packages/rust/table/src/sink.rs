use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use partgen_shared::{
    PartGenError, Result, Row, WEB_DESCRIPTION_COLUMN, WEB_TITLE_COLUMN, is_output_column,
};

/// `{output_dir}/processed_{YYYYmmdd_HHMMSS}.csv`, stamped with local time.
pub fn default_output_path(output_dir: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    output_dir.join(format!("processed_{stamp}.csv"))
}

/// Append-only CSV writer shared by all row workers.
///
/// Every call writes one complete record with a single
/// open-append-write-close, under a mutex, so a crash leaves a file whose
/// records are all whole.
#[derive(Debug)]
pub struct OutputSink {
    path: PathBuf,
    delimiter: u8,
    /// Indices of the input columns that are carried into the output.
    kept: Vec<usize>,
    header: Vec<String>,
    lock: Mutex<()>,
}

impl OutputSink {
    /// Create (or truncate) `path` and write the header.
    ///
    /// Input columns named `WEB TITLE` / `WEB DESCRIPTION` are not carried
    /// over; the freshly generated pair is always appended last.
    pub async fn create(path: impl Into<PathBuf>, input_columns: &[String], delimiter: u8) -> Result<Self> {
        let path = path.into();

        let kept: Vec<usize> = input_columns
            .iter()
            .enumerate()
            .filter(|(_, name)| !is_output_column(name))
            .map(|(i, _)| i)
            .collect();

        let mut header: Vec<String> = kept.iter().map(|&i| input_columns[i].clone()).collect();
        header.push(WEB_TITLE_COLUMN.to_string());
        header.push(WEB_DESCRIPTION_COLUMN.to_string());

        let sink = Self {
            path,
            delimiter,
            kept,
            header,
            lock: Mutex::new(()),
        };

        let bytes = sink.encode(sink.header.iter().map(String::as_str))?;
        sink.write_with_retry(&bytes, WriteMode::Truncate).await?;

        info!(path = %sink.path.display(), columns = sink.header.len(), "output file created");
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Append one processed row with its generated title and description.
    pub async fn append(&self, row: &Row, title: &str, description: &str) -> Result<()> {
        let raw = row.raw();
        let cells = self
            .kept
            .iter()
            .map(|&i| raw.get(i).map(String::as_str).unwrap_or(""))
            .chain([title, description]);

        let bytes = self.encode(cells)?;
        self.write_with_retry(&bytes, WriteMode::Append).await
    }

    fn encode<'a>(&self, cells: impl Iterator<Item = &'a str>) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(Vec::new());
        writer
            .write_record(cells)
            .map_err(|e| PartGenError::Table(format!("failed to encode record: {e}")))?;
        writer
            .into_inner()
            .map_err(|e| PartGenError::Table(format!("failed to encode record: {e}")))
    }

    async fn write_with_retry(&self, bytes: &[u8], mode: WriteMode) -> Result<()> {
        let _guard = self.lock.lock().await;

        match write_once(&self.path, bytes, mode).await {
            Ok(()) => Ok(()),
            Err(first) if first.is_permission_denied() || first.is_not_found() => {
                warn!(path = %self.path.display(), error = %first, "output write failed, fixing permissions and retrying");
                repair_parent(&self.path).await;
                write_once(&self.path, bytes, mode).await
            }
            Err(other) => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Truncate,
    Append,
}

async fn write_once(path: &Path, bytes: &[u8], mode: WriteMode) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    match mode {
        WriteMode::Truncate => options.write(true).create(true).truncate(true),
        WriteMode::Append => options.append(true).create(true),
    };

    let mut file = options.open(path).await.map_err(|e| PartGenError::io(path, e))?;
    file.write_all(bytes).await.map_err(|e| PartGenError::io(path, e))?;
    file.flush().await.map_err(|e| PartGenError::io(path, e))?;
    Ok(())
}

/// Best-effort: create the parent directory and make it writable.
async fn repair_parent(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };

    if let Err(e) = tokio::fs::create_dir_all(parent).await {
        debug!(dir = %parent.display(), error = %e, "could not create output directory");
        return;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        if let Err(e) = tokio::fs::set_permissions(parent, perms).await {
            debug!(dir = %parent.display(), error = %e, "could not set output directory mode");
        }
    }
}
