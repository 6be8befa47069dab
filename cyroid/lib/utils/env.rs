use std::{env, path::PathBuf};

use crate::config::DEFAULT_CYROID_HOME;

use super::{CYROID_DB_FILENAME, CYROID_HOME_ENV_VAR};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The cyroid home directory: `$CYROID_HOME` if set, otherwise `~/.cyroid`.
pub fn cyroid_home_path() -> PathBuf {
    match env::var_os(CYROID_HOME_ENV_VAR) {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => DEFAULT_CYROID_HOME.clone(),
    }
}

/// The range database under the cyroid home directory.
pub fn default_db_path() -> PathBuf {
    cyroid_home_path().join(CYROID_DB_FILENAME)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_home_from_env() {
        env::set_var(CYROID_HOME_ENV_VAR, "/tmp/cyroid-home");
        assert_eq!(cyroid_home_path(), PathBuf::from("/tmp/cyroid-home"));
        assert_eq!(
            default_db_path(),
            PathBuf::from("/tmp/cyroid-home/cyroid.db")
        );
        env::remove_var(CYROID_HOME_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_home_defaults_when_unset_or_empty() {
        env::set_var(CYROID_HOME_ENV_VAR, "");
        assert_eq!(cyroid_home_path(), *DEFAULT_CYROID_HOME);

        env::remove_var(CYROID_HOME_ENV_VAR);
        assert_eq!(default_db_path(), DEFAULT_CYROID_HOME.join("cyroid.db"));
    }
}
