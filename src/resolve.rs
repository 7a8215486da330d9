//! Host name / address literal to destination address.

use std::net::{IpAddr, ToSocketAddrs};

use tracing::debug;

use crate::error::ResolveError;
use crate::icmp::Family;

/// Family flags from the command line. At most one may be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressPreference {
    pub prefer_v4: bool,
    pub prefer_v6: bool,
}

impl AddressPreference {
    fn family(&self) -> Result<Option<Family>, ResolveError> {
        match (self.prefer_v4, self.prefer_v6) {
            (true, true) => Err(ResolveError::ConflictingFamilies),
            (true, false) => Ok(Some(Family::V4)),
            (false, true) => Ok(Some(Family::V6)),
            (false, false) => Ok(None),
        }
    }
}

/// Resolves `host` to one address.
///
/// Literals are checked against the requested family. Names go through the
/// system resolver; without a preference IPv4 is chosen when available.
pub fn resolve(host: &str, preference: AddressPreference) -> Result<IpAddr, ResolveError> {
    let wanted = preference.family()?;

    if let Ok(addr) = host.parse::<IpAddr>() {
        return match wanted {
            Some(family) if Family::of(&addr) != family => {
                Err(ResolveError::FamilyMismatch { addr, family })
            }
            _ => Ok(addr),
        };
    }

    let addrs: Vec<IpAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(|source| ResolveError::Lookup {
            host: host.to_string(),
            source,
        })?
        .map(|sa| sa.ip())
        .collect();
    debug!(host, candidates = addrs.len(), "name resolved");

    select(host, &addrs, wanted)
}

/// Picks the address to probe out of a lookup result.
fn select(host: &str, addrs: &[IpAddr], wanted: Option<Family>) -> Result<IpAddr, ResolveError> {
    let family = wanted.unwrap_or(Family::V4);
    if let Some(addr) = addrs.iter().find(|a| Family::of(a) == family) {
        return Ok(*addr);
    }
    let fallback = match wanted {
        // No preference: take whatever the resolver returned first
        None => addrs.first().copied(),
        Some(_) => None,
    };
    fallback.ok_or_else(|| ResolveError::NoAddress {
        host: host.to_string(),
        family,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pref(prefer_v4: bool, prefer_v6: bool) -> AddressPreference {
        AddressPreference {
            prefer_v4,
            prefer_v6,
        }
    }

    #[test]
    fn test_conflicting_flags_fail_first() {
        // Even a valid literal is rejected
        assert!(matches!(
            resolve("192.0.2.1", pref(true, true)),
            Err(ResolveError::ConflictingFamilies)
        ));
    }

    #[test]
    fn test_literals() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(resolve("192.0.2.1", pref(false, false)).unwrap(), v4);
        assert_eq!(resolve("192.0.2.1", pref(true, false)).unwrap(), v4);
        assert_eq!(resolve("2001:db8::1", pref(false, false)).unwrap(), v6);
        assert_eq!(resolve("2001:db8::1", pref(false, true)).unwrap(), v6);
        assert!(matches!(
            resolve("192.0.2.1", pref(false, true)),
            Err(ResolveError::FamilyMismatch {
                family: Family::V6,
                ..
            })
        ));
        assert!(matches!(
            resolve("2001:db8::1", pref(true, false)),
            Err(ResolveError::FamilyMismatch {
                family: Family::V4,
                ..
            })
        ));
    }

    #[test]
    fn test_select_prefers_v4_by_default() {
        let addrs: Vec<IpAddr> = vec!["2001:db8::1".parse().unwrap(), "192.0.2.1".parse().unwrap()];
        assert_eq!(select("h", &addrs, None).unwrap(), addrs[1]);
        assert_eq!(select("h", &addrs, Some(Family::V6)).unwrap(), addrs[0]);
    }

    #[test]
    fn test_select_falls_back_without_preference() {
        let addrs: Vec<IpAddr> = vec!["2001:db8::1".parse().unwrap()];
        assert_eq!(select("h", &addrs, None).unwrap(), addrs[0]);
        assert!(matches!(
            select("h", &addrs, Some(Family::V4)),
            Err(ResolveError::NoAddress { .. })
        ));
        assert!(select("h", &[], None).is_err());
    }
}
