//! Cache fingerprinting (spec.md §3 CacheEntry.fingerprint, §4.9,
//! §8 property 3): a stable 128-bit non-cryptographic hash of
//! `service || method || canonical_request_bytes || tenant ||
//! accept_language`. `twox_hash::xxh3` is added for this — the pack's
//! `estuary-flow` reaches for `fxhash` for the same non-cryptographic-
//! hash need; xxh3 is the better-maintained equivalent and `twox-hash`
//! already ships it.

pub fn fingerprint(
    service: &str,
    method: &str,
    canonical_request: &[u8],
    tenant: Option<&str>,
    accept_language: Option<&str>,
) -> u128 {
    let mut buf = Vec::with_capacity(service.len() + method.len() + canonical_request.len() + 16);
    buf.extend_from_slice(service.as_bytes());
    buf.push(0);
    buf.extend_from_slice(method.as_bytes());
    buf.push(0);
    buf.extend_from_slice(canonical_request);
    buf.push(0);
    buf.extend_from_slice(tenant.unwrap_or("").as_bytes());
    buf.push(0);
    buf.extend_from_slice(accept_language.unwrap_or("").as_bytes());
    twox_hash::xxh3::hash128(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let a = fingerprint("echo", "Say", b"{\"msg\":\"hi\"}", Some("tenant-1"), None);
        let b = fingerprint("echo", "Say", b"{\"msg\":\"hi\"}", Some("tenant-1"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn different_tenants_produce_different_fingerprints() {
        let a = fingerprint("echo", "Say", b"{\"msg\":\"hi\"}", Some("tenant-1"), None);
        let b = fingerprint("echo", "Say", b"{\"msg\":\"hi\"}", Some("tenant-2"), None);
        assert_ne!(a, b);
    }

    #[test]
    fn different_methods_produce_different_fingerprints() {
        let a = fingerprint("echo", "Say", b"{}", None, None);
        let b = fingerprint("echo", "Shout", b"{}", None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn different_accept_language_produces_different_fingerprints() {
        let a = fingerprint("echo", "Say", b"{}", None, Some("en-US"));
        let b = fingerprint("echo", "Say", b"{}", None, Some("fr-FR"));
        assert_ne!(a, b);
    }
}
