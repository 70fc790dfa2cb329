//! The on-disk contract between pipeline stages. All path composition for
//! source models and reach submodels lives here; stages receive a typed
//! handle and never format paths themselves. Stages discover their inputs
//! by walking this layout, never by consulting external state.

use crate::StageError;
use std::path::{Path, PathBuf};

/// A source model directory: the original project/geometry/plan/flow files
/// plus the extracted geopackage and the conflation document.
#[derive(Debug, Clone)]
pub struct SourceModel {
    root: PathBuf,
    name: String,
}

impl SourceModel {
    /// Open an existing source-model bundle, which must contain exactly one
    /// project file.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StageError> {
        let root = root.into();
        let mut prj = Vec::new();
        let entries = std::fs::read_dir(&root).map_err(|err| {
            StageError::NotASourceModel(format!("{}: {err}", root.display()))
        })?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("prj") {
                prj.push(path);
            }
        }
        match prj.as_slice() {
            [only] => {
                let name = only
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .ok_or_else(|| {
                        StageError::NotASourceModel(format!(
                            "project file {} has no usable stem",
                            only.display()
                        ))
                    })?
                    .to_string();
                Ok(Self { root, name })
            }
            [] => Err(StageError::NotASourceModel(format!(
                "{} contains no project file",
                root.display()
            ))),
            many => Err(StageError::NotASourceModel(format!(
                "{} contains {} project files",
                root.display(),
                many.len()
            ))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_path(&self) -> PathBuf {
        self.root.join(format!("{}.prj", self.name))
    }

    pub fn geometry_path(&self, suffix: &str) -> PathBuf {
        self.root.join(format!("{}.g{suffix}", self.name))
    }

    pub fn plan_path(&self, suffix: &str) -> PathBuf {
        self.root.join(format!("{}.p{suffix}", self.name))
    }

    pub fn flow_path(&self, suffix: &str) -> PathBuf {
        self.root.join(format!("{}.f{suffix}", self.name))
    }

    pub fn gpkg_path(&self) -> PathBuf {
        self.root.join(format!("{}.gpkg", self.name))
    }

    pub fn conflation_path(&self) -> PathBuf {
        self.root.join(format!("{}.conflation.json", self.name))
    }

    /// Plan suffixes present on disk, in suffix order.
    pub fn plan_suffixes(&self) -> Result<Vec<String>, StageError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&format!("{}.p", self.name)) else {
                continue;
            };
            if rest.len() == 2 && rest.chars().all(|c| c.is_ascii_digit()) {
                out.push(rest.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

/// A reach submodel directory, keyed by network reach id.
#[derive(Debug, Clone)]
pub struct Submodel {
    root: PathBuf,
    reach: String,
}

impl Submodel {
    /// A handle to the submodel for `reach` under `root`. Nothing is
    /// created; `create` establishes the directory.
    pub fn new(root: impl Into<PathBuf>, reach: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            reach: reach.into(),
        }
    }

    /// Open a handle to an existing submodel directory, inferring the reach
    /// id from the directory name.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StageError> {
        let dir = dir.as_ref();
        let reach = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                StageError::Precondition(format!("{} is not a submodel directory", dir.display()))
            })?
            .to_string();
        let root = dir
            .parent()
            .ok_or_else(|| {
                StageError::Precondition(format!("{} has no parent directory", dir.display()))
            })?
            .to_path_buf();
        Ok(Self { root, reach })
    }

    pub fn create(&self) -> Result<(), StageError> {
        std::fs::create_dir_all(self.dir())?;
        Ok(())
    }

    pub fn reach(&self) -> &str {
        &self.reach
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.reach)
    }

    pub fn gpkg_path(&self) -> PathBuf {
        self.dir().join(format!("{}.gpkg", self.reach))
    }

    pub fn terrain_dir(&self) -> PathBuf {
        self.dir().join("Terrain")
    }

    pub fn terrain_path(&self) -> PathBuf {
        self.terrain_dir().join(format!("{}.hdf", self.reach))
    }

    pub fn agreement_path(&self) -> PathBuf {
        self.terrain_dir().join(format!("{}.agreement.json", self.reach))
    }

    pub fn plan_path(&self, suffix: &str) -> PathBuf {
        self.dir().join(format!("{}.p{suffix}", self.reach))
    }

    pub fn flow_path(&self, suffix: &str) -> PathBuf {
        self.dir().join(format!("{}.f{suffix}", self.reach))
    }

    pub fn results_path(&self, suffix: &str) -> PathBuf {
        self.dir().join(format!("{}.r{suffix}", self.reach))
    }

    /// Unclipped depth grids of one plan generation.
    pub fn depth_grid_dir(&self, suffix: &str) -> PathBuf {
        self.dir().join("depth_grids").join(format!("p{suffix}"))
    }

    /// The clipped flood-inundation map library.
    pub fn fim_dir(&self) -> PathBuf {
        self.dir().join("fims").join(&self.reach)
    }

    pub fn rating_db_path(&self) -> PathBuf {
        self.dir().join(format!("{}.db", self.reach))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir().join(".lock")
    }

    /// Acquire the submodel's advisory lock. At most one job mutates a
    /// submodel at a time; contention is `ReachBusy` and the caller retries.
    pub fn lock(&self) -> Result<DirLock, StageError> {
        DirLock::try_acquire(&self.lock_path(), &self.reach)
    }
}

/// An exclusive advisory flock over a submodel directory, released on drop.
#[derive(Debug)]
pub struct DirLock {
    file: std::fs::File,
}

impl DirLock {
    fn try_acquire(path: &Path, reach: &str) -> Result<DirLock, StageError> {
        use std::os::fd::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(StageError::ReachBusy(format!(
                    "another job holds the lock for reach {reach}"
                )));
            }
            return Err(err.into());
        }
        tracing::debug!(?path, "acquired submodel lock");
        Ok(DirLock { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_source_model_requires_one_project_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SourceModel::open(dir.path()),
            Err(StageError::NotASourceModel(_))
        ));

        std::fs::write(dir.path().join("Baxter.prj"), b"{}").unwrap();
        let model = SourceModel::open(dir.path()).unwrap();
        assert_eq!(model.name(), "Baxter");
        assert!(model.gpkg_path().ends_with("Baxter.gpkg"));

        std::fs::write(dir.path().join("Other.prj"), b"{}").unwrap();
        assert!(matches!(
            SourceModel::open(dir.path()),
            Err(StageError::NotASourceModel(_))
        ));
    }

    #[test]
    fn test_plan_suffix_discovery() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Baxter.prj"), b"{}").unwrap();
        std::fs::write(dir.path().join("Baxter.p02"), b"{}").unwrap();
        std::fs::write(dir.path().join("Baxter.p01"), b"{}").unwrap();
        std::fs::write(dir.path().join("Baxter.p1"), b"{}").unwrap();
        std::fs::write(dir.path().join("Baxter.f01"), b"{}").unwrap();

        let model = SourceModel::open(dir.path()).unwrap();
        assert_eq!(model.plan_suffixes().unwrap(), vec!["01", "02"]);
    }

    #[test]
    fn test_submodel_paths_follow_the_layout() {
        let sub = Submodel::new("/data/submodels", "2823932");
        assert_eq!(sub.gpkg_path(), Path::new("/data/submodels/2823932/2823932.gpkg"));
        assert_eq!(
            sub.terrain_path(),
            Path::new("/data/submodels/2823932/Terrain/2823932.hdf")
        );
        assert_eq!(
            sub.plan_path("03"),
            Path::new("/data/submodels/2823932/2823932.p03")
        );
        assert_eq!(
            sub.fim_dir(),
            Path::new("/data/submodels/2823932/fims/2823932")
        );
        assert_eq!(
            sub.rating_db_path(),
            Path::new("/data/submodels/2823932/2823932.db")
        );
    }

    #[test]
    fn test_dir_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let sub = Submodel::new(dir.path(), "2823932");
        sub.create().unwrap();

        let held = sub.lock().unwrap();
        assert!(matches!(sub.lock(), Err(StageError::ReachBusy(_))));
        std::mem::drop(held);
        assert!(sub.lock().is_ok());
    }
}
