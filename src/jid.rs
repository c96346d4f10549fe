//! XMPP addresses (`local@domain/resource`).

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(local: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Jid {
            local: local.map(str::to_string),
            domain: domain.to_ascii_lowercase(),
            resource: resource.map(str::to_string),
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// This address without its resource part.
    pub fn bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            resource: Some(resource.to_string()),
            ..self.bare()
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // The resource may itself contain '@' or '/', so split it off first
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (s, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };

        if domain.is_empty() {
            return Err(Error::Config(format!("invalid JID '{}': empty domain", s)));
        }
        if local.is_some_and(str::is_empty) {
            return Err(Error::Config(format!("invalid JID '{}': empty local part", s)));
        }
        if resource.is_some_and(str::is_empty) {
            return Err(Error::Config(format!("invalid JID '{}': empty resource", s)));
        }
        Ok(Jid::new(local, domain, resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "alice@Example.COM/laptop".parse().unwrap();
        assert_eq!(jid.local(), Some("alice"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("laptop"));
        assert_eq!(jid.to_string(), "alice@example.com/laptop");
        assert_eq!(jid.bare().to_string(), "alice@example.com");
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let jid: Jid = "room@muc.example.com/nick@home/2".parse().unwrap();
        assert_eq!(jid.local(), Some("room"));
        assert_eq!(jid.resource(), Some("nick@home/2"));
    }

    #[test]
    fn test_domain_only() {
        let jid: Jid = "example.com".parse().unwrap();
        assert!(jid.is_bare());
        assert_eq!(jid.local(), None);
        assert_eq!(jid.with_resource("r").to_string(), "example.com/r");
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert!("".parse::<Jid>().is_err());
        assert!("@example.com".parse::<Jid>().is_err());
        assert!("alice@example.com/".parse::<Jid>().is_err());
    }
}
