//! [`StateStore`] keeping one file per cluster on the local filesystem.

use {
    super::{codec, Error, StateStore},
    cirrus_core::{Cluster, ClusterSpec, Credentials},
    std::{
        io,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

const STATE_FILE_NAME: &str = "instances";
const TMP_STATE_FILE_NAME: &str = "instances.tmp";

/// Stores the state of a cluster in `<dir>/<cluster-name>/instances`.
#[derive(Clone, Debug)]
pub struct FileStateStore {
    cluster_name: String,
    cluster_dir: PathBuf,
    credentials: Arc<Credentials>,
}

impl FileStateStore {
    pub fn new(dir: &Path, spec: &ClusterSpec) -> Self {
        Self {
            cluster_name: spec.cluster_name.clone(),
            cluster_dir: dir.join(&spec.cluster_name),
            credentials: spec.credentials.clone(),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> PathBuf {
        self.cluster_dir.join(STATE_FILE_NAME)
    }
}

impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Cluster, Error> {
        let bytes = match tokio::fs::read(self.path()).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(self.cluster_name.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let content = String::from_utf8(bytes).map_err(|_| Error::Encoding)?;

        Ok(codec::deserialize(&self.credentials, &content)?)
    }

    async fn save(&self, cluster: &Cluster) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.cluster_dir).await?;

        // Write to a temporary file first, so that a crash mid-write doesn't
        // leave a truncated record behind.
        let tmp = self.cluster_dir.join(TMP_STATE_FILE_NAME);
        tokio::fs::write(&tmp, codec::serialize(cluster)).await?;
        tokio::fs::rename(&tmp, self.path()).await?;

        tracing::info!(
            cluster = %self.cluster_name,
            path = %self.path().display(),
            instances = cluster.len(),
            "Wrote instances file"
        );

        Ok(())
    }

    async fn destroy(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Only succeeds if nothing else has been put into the directory.
        let _ = tokio::fs::remove_dir(&self.cluster_dir).await;

        Ok(())
    }
}
