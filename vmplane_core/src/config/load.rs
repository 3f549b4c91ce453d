use super::VmplaneConfig;
// Global vars
use super::CONFIG_DIR;

// Config
use std::fs;
use std::path::{Path, PathBuf};

// Error Handling
use log::{debug, info};
use vmplane_error::{CastError, TomlError, VmplaneError};

impl VmplaneConfig {
    /*
     * Get config from crate directory
     */
    fn debug_path() -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("./vmplane.config.toml");
        return path;
    }
    /*
     * Get config from FHS path.
     */
    fn release_path() -> PathBuf {
        let mut path = PathBuf::from(CONFIG_DIR);
        path.push("config.toml");
        return path;
    }
    pub fn get() -> Result<Self, VmplaneError> {
        info!("Search config file.");

        #[cfg(debug_assertions)]
        let path = Self::debug_path();

        #[cfg(not(debug_assertions))]
        let path = Self::release_path();

        let path = path.display().to_string();
        let config = Self::from_file(&path)?;

        Ok(config)
    }
    pub fn from_file(path: &str) -> Result<Self, VmplaneError> {
        debug!("Read config file {:#?}", path);
        let string = fs::read_to_string(path)?;
        Self::from_toml(&string)
    }
    pub fn from_toml(string: &str) -> Result<Self, VmplaneError> {
        let res = toml::from_str::<Self>(&string);
        let item = match res {
            Ok(res) => res,
            Err(e) => {
                let err = CastError::TomlError(TomlError::new(e, &string));
                return Err(err.into());
            }
        };
        Ok(item)
    }
    /// Ensure working directories exist.
    pub async fn ensure_directories(&self) -> Result<(), VmplaneError> {
        let directories = [&self.storage.default_pool_path, &self.reports.dir];
        for directory in directories {
            if !Path::new(directory).exists() {
                tokio::fs::create_dir_all(directory).await?;
            }
        }
        info!("[init] created vmplane filetree.");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    // Error Handling
    use miette::Result;

    #[test]
    fn read_config_from_crate_dir() -> Result<()> {
        let config = VmplaneConfig::get()?;
        assert_eq!(config, VmplaneConfig::default());
        Ok(())
    }

    #[test]
    fn partial_config_keeps_defaults() -> Result<()> {
        let toml = r#"
        [storage]
        default_pool = "fast"

        [limits]
        max_body_size = 1024
        "#;
        let config = VmplaneConfig::from_toml(toml)?;
        assert_eq!(config.storage.default_pool, "fast");
        assert_eq!(config.storage.iso_collection, "isos");
        assert_eq!(config.limits.max_body_size, 1024);
        assert_eq!(config.network.iface_model, "e1000");
        assert_eq!(config.vm.min_memory, 256);
        Ok(())
    }

    #[test]
    fn reject_malformed_config() -> Result<()> {
        let res = VmplaneConfig::from_toml("[vm]\ncpus = \"four\"");
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn create_working_directories() -> Result<()> {
        let dir = tempfile::tempdir().map_err(VmplaneError::from)?;
        let mut config = VmplaneConfig::default();
        config.storage.default_pool_path = dir.path().join("images").display().to_string();
        config.reports.dir = dir.path().join("reports").display().to_string();
        config.ensure_directories().await?;
        assert!(dir.path().join("images").exists());
        assert!(dir.path().join("reports").exists());
        Ok(())
    }
}
