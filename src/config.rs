use crate::account::{SettingsStore, SigningSettings};
use anyhow::{Context, Error};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Thin TOML (de)serialization layer for on-disk settings documents.
#[derive(Debug, Clone)]
pub struct TomlConfiguration {
    document: toml_edit::DocumentMut,
}

impl TomlConfiguration {
    fn load_toml<P: AsRef<Path>>(file: P) -> Result<Self, Error> {
        let file = file.as_ref();
        let document = std::fs::read_to_string(file)
            .context(format!("Reading settings file {}", file.display()))?;
        let document = toml_edit::DocumentMut::from_str(&document)
            .context(format!("Parsing settings file {}", file.display()))?;
        Ok(Self { document })
    }

    fn write_toml<P: AsRef<Path>>(&self, file: P) -> Result<(), Error> {
        let file = file.as_ref();
        let toml = self.document.to_string();
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Creating directory {}", parent.display()))?;
        }
        std::fs::write(file, toml).context(format!("Saving settings file {}", file.display()))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>, T>(file: P) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let filename = file.as_ref();
        let toml = Self::load_toml(filename)?;
        toml_edit::de::from_document(toml.document)
            .context(format!("Parsing settings file {}", filename.display()))
    }

    pub fn save<T, P: AsRef<Path>>(config: &T, file: P) -> Result<(), Error>
    where
        T: Serialize,
    {
        let pretty_string = toml_edit::ser::to_string_pretty(config)?;
        let document = toml_edit::DocumentMut::from_str(&pretty_string)?;
        let toml = Self { document };
        toml.write_toml(file)
    }
}

/// File-backed [`SettingsStore`] holding the signing settings blob. A legacy
/// plaintext account key file next to the blob is migrated into the blob on
/// first load, then deleted.
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    blob_path: PathBuf,
    legacy_key_path: PathBuf,
}

impl FileSettingsStore {
    pub const DEFAULT_BLOB_NAME: &'static str = "signing.toml";
    pub const LEGACY_KEY_NAME: &'static str = "account.key";

    pub fn new(config_directory: &Path) -> Self {
        Self {
            blob_path: config_directory.join(Self::DEFAULT_BLOB_NAME),
            legacy_key_path: config_directory.join(Self::LEGACY_KEY_NAME),
        }
    }

    fn migrate_legacy_key(&self) -> anyhow::Result<Option<SigningSettings>> {
        if !self.legacy_key_path.exists() {
            return Ok(None);
        }
        let key_path = self.legacy_key_path.display();
        info!("Migrating legacy account key file {key_path} into the settings blob");
        let key_pem = std::fs::read_to_string(&self.legacy_key_path)
            .context(format!("Reading legacy key file {key_path}"))?;
        let settings = SigningSettings {
            account_email: None,
            account_uri: None,
            account_key_pem: Some(key_pem),
        };
        TomlConfiguration::save(&settings, &self.blob_path)?;
        std::fs::remove_file(&self.legacy_key_path)
            .context(format!("Deleting migrated legacy key file {key_path}"))?;
        Ok(Some(settings))
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> anyhow::Result<Option<SigningSettings>> {
        if self.blob_path.exists() {
            let settings = TomlConfiguration::load(&self.blob_path)?;
            return Ok(Some(settings));
        }
        self.migrate_legacy_key()
    }

    fn save(&self, settings: &SigningSettings) -> anyhow::Result<()> {
        TomlConfiguration::save(settings, &self.blob_path)
    }
}
