//! Where configuration and credentials live.
//!
//! ```text
//! ~
//!  └── .pimsync
//!       └── credentials.yaml
//!
//! pwd
//!  └── pimsync.yaml   (or any directory of *.yaml files, passed explicitly)
//! ```

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use dirs::home_dir;
use lazy_static::lazy_static;
use yaml_peg::serde as yaml;

use crate::logging::debug;

lazy_static! {
    static ref PROFILE_CFG_DIR: PathBuf = PathBuf::from(".pimsync");
    static ref CREDENTIALS_CFG: PathBuf = PathBuf::from("credentials.yaml");
    static ref DEFAULT_CONFIG: PathBuf = PathBuf::from("pimsync.yaml");
}

/// Alias for HashMap to hold credentials information.
pub type CredentialsMap = HashMap<String, String>;

/// Path for the credentials file in the user's home directory
pub fn credentials_path() -> Result<PathBuf> {
    Ok(home_dir()
        .ok_or_else(|| anyhow!("unable to find the home directory"))?
        .join(PROFILE_CFG_DIR.as_path())
        .join(CREDENTIALS_CFG.as_path()))
}

/// Config path used when none is given
pub fn default_config_path() -> PathBuf {
    DEFAULT_CONFIG.clone()
}

/// Read a flat credentials file
pub fn fetch_credentials<P: AsRef<Path>>(path: P) -> Result<CredentialsMap> {
    let path = path.as_ref();
    debug!("Trying to read credentials from {:?}", path);
    let credentials_raw =
        fs::read_to_string(path).context(format!("reading credentials from {}", path.display()))?;
    let mut creds = yaml::from_str::<CredentialsMap>(&credentials_raw)
        .context(format!("parsing credentials from {}", path.display()))?;

    creds
        .pop()
        .ok_or_else(|| anyhow!("no credentials found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn credentials_are_read_as_a_map() -> Result<()> {
        let path = std::env::temp_dir().join(format!("pimsync-creds-{}.yaml", Uuid::new_v4()));
        fs::write(
            &path,
            "tenantId: t1\nclientId: c1\nclientSecret: shh\n",
        )?;
        let creds = fetch_credentials(&path)?;
        fs::remove_file(&path)?;

        assert_eq!(creds["tenantId"], "t1");
        assert_eq!(creds["clientSecret"], "shh");
        assert_eq!(creds.len(), 3);
        Ok(())
    }

    #[test]
    fn credentials_live_in_the_profile_dir() -> Result<()> {
        let path = credentials_path()?;
        assert!(path.ends_with(".pimsync/credentials.yaml"));
        Ok(())
    }
}
