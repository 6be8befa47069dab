use std::{fmt, sync::LazyLock};

use regex::Regex;

use crate::{CyroidError, CyroidResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static RESOURCE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

static INTERFACE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]{0,14}$").expect("valid regex"));

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));

static DESCRIPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 _.,:/()-]{0,255}$").expect("valid regex"));

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,62})(\.[A-Za-z0-9]([A-Za-z0-9-]{0,62}))*$")
        .expect("valid regex")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A Docker network or DHCP pool name restricted to `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName(String);

/// A kernel interface name (`eth1`, `br-0123456789ab`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceName(String);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResourceName {
    /// Validates `name`.
    ///
    /// ## Examples
    ///
    /// ```
    /// use cyroid::command::ResourceName;
    ///
    /// assert!(ResourceName::new("dmz_net-1").is_ok());
    /// assert!(ResourceName::new("dmz; rm -rf /").is_err());
    /// ```
    pub fn new(name: impl Into<String>) -> CyroidResult<Self> {
        let name = name.into();
        if RESOURCE_NAME_RE.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(CyroidError::InvalidName(name))
        }
    }

    /// The validated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl InterfaceName {
    /// Validates `name`.
    pub fn new(name: impl Into<String>) -> CyroidResult<Self> {
        let name = name.into();
        if INTERFACE_NAME_RE.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(CyroidError::InvalidParameter {
                name: "interface",
                value: name,
            })
        }
    }

    /// The sandbox uplink.
    pub fn uplink() -> Self {
        Self("eth0".to_string())
    }

    /// The validated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates a Linux login name.
pub fn validate_username(username: &str) -> CyroidResult<&str> {
    if USERNAME_RE.is_match(username) {
        Ok(username)
    } else {
        Err(CyroidError::InvalidParameter {
            name: "username",
            value: username.to_string(),
        })
    }
}

/// Validates a password passed as a positional argument. Line breaks are the only thing that
/// could corrupt the `user:password` line fed to `chpasswd`.
pub fn validate_password(password: &str) -> CyroidResult<&str> {
    if password.is_empty() || password.contains(['\n', '\r', '\0']) {
        Err(CyroidError::InvalidParameter {
            name: "password",
            value: "<redacted>".to_string(),
        })
    } else {
        Ok(password)
    }
}

/// Validates a free-form interface description.
pub fn validate_description(description: &str) -> CyroidResult<&str> {
    if DESCRIPTION_RE.is_match(description) {
        Ok(description)
    } else {
        Err(CyroidError::InvalidParameter {
            name: "description",
            value: description.to_string(),
        })
    }
}

/// Validates a DNS domain.
pub fn validate_domain(domain: &str) -> CyroidResult<&str> {
    if domain.len() <= 253 && DOMAIN_RE.is_match(domain) {
        Ok(domain)
    } else {
        Err(CyroidError::InvalidParameter {
            name: "domain",
            value: domain.to_string(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
