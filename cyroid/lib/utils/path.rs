//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the user's home where cyroid keeps local state.
pub const CYROID_HOME_DIR: &str = ".cyroid";

/// The filename of the range database.
pub const CYROID_DB_FILENAME: &str = "cyroid.db";

/// The environment variable that overrides the cyroid home directory.
pub const CYROID_HOME_ENV_VAR: &str = "CYROID_HOME";
