//! Connection identity used to deduplicate pooled connections

use crate::config::{ConnectionDescriptor, ConnectionOptions};
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic key for a target connection plus its optional proxy
///
/// Every authentication and addressing field takes part, so two different
/// credentials never share a pool slot. `sudo` and `timeout` do not: they
/// change how a connection is used or dialed, not who it is logged in as.
/// The key is a SHA-256 digest so it can be logged without leaking secrets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionIdentity(String);

impl ConnectionIdentity {
    /// Identity for raw connection options
    pub fn new(target: &ConnectionOptions, proxy: Option<&ConnectionOptions>) -> Self {
        let mut hasher = Sha256::new();
        hash_options(&mut hasher, target);
        match proxy {
            Some(proxy) => {
                hasher.update([1u8]);
                hash_options(&mut hasher, proxy);
            }
            None => hasher.update([0u8]),
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Identity for built descriptors
    pub fn of(target: &ConnectionDescriptor, proxy: Option<&ConnectionDescriptor>) -> Self {
        Self::new(target.options(), proxy.map(ConnectionDescriptor::options))
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12])
    }
}

fn hash_options(hasher: &mut Sha256, options: &ConnectionOptions) {
    hash_field(hasher, Some(options.host.as_str()));
    hash_field(hasher, Some(options.port.to_string().as_str()));
    hash_field(hasher, Some(options.user.as_str()));
    hash_field(hasher, options.password());
    hash_field(hasher, options.private_key());
    hash_field(hasher, options.private_key_path());
    hash_field(hasher, options.private_key_env_var());
    hasher.update([options.agent as u8]);
}

// Length-prefixed so adjacent fields can never run together.
fn hash_field(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(value) => {
            hasher.update([1u8]);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> ConnectionOptions {
        ConnectionOptions::new("remotehost", "root").with_password("password")
    }

    #[test]
    fn test_identity_is_stable() {
        let a = ConnectionIdentity::new(&base(), None);
        let b = ConnectionIdentity::new(&base(), None);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.to_string().len(), 12);
    }

    #[test]
    fn test_sudo_and_timeout_do_not_matter() {
        let a = ConnectionIdentity::new(&base(), None);
        let b = ConnectionIdentity::new(&base().with_sudo(true).with_timeout(500), None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_every_auth_field_matters() {
        let reference = ConnectionIdentity::new(&base(), None);
        let variants = vec![
            base().with_port(2222),
            ConnectionOptions::new("otherhost", "root").with_password("password"),
            ConnectionOptions::new("remotehost", "admin").with_password("password"),
            base().with_password("other"),
            base().with_private_key("key"),
            base().with_private_key_path("/id_rsa"),
            base().with_private_key_env_var("SSH_KEY"),
            base().with_agent(true),
        ];

        for variant in variants {
            assert_ne!(
                ConnectionIdentity::new(&variant, None),
                reference,
                "collision for {:?}",
                variant
            );
        }
    }

    #[test]
    fn test_proxy_fields_matter() {
        let proxy = ConnectionOptions::new("p", "jump").with_port(2222);
        let direct = ConnectionIdentity::new(&base(), None);
        let proxied = ConnectionIdentity::new(&base(), Some(&proxy));
        let other_proxy =
            ConnectionIdentity::new(&base(), Some(&proxy.clone().with_password("x")));

        assert_ne!(direct, proxied);
        assert_ne!(proxied, other_proxy);
    }

    #[test]
    fn test_fields_do_not_run_together() {
        let a = ConnectionOptions::new("ab", "c");
        let b = ConnectionOptions::new("a", "bc");
        assert_ne!(
            ConnectionIdentity::new(&a, None),
            ConnectionIdentity::new(&b, None)
        );
    }

    #[test]
    fn test_descriptor_identity_matches_options() {
        let (_, descriptor) = crate::config::build_connection(&base()).unwrap();
        assert_eq!(
            ConnectionIdentity::of(&descriptor, None),
            ConnectionIdentity::new(&base(), None)
        );
    }

    fn small() -> impl Strategy<Value = Option<String>> {
        prop_oneof![Just(None), Just(Some("a".to_string())), Just(Some("b".to_string()))]
    }

    fn options() -> impl Strategy<Value = ConnectionOptions> {
        (
            prop_oneof![Just("h1"), Just("h2")],
            prop_oneof![Just(22u16), Just(2222u16)],
            prop_oneof![Just("root"), Just("admin")],
            small(),
            small(),
            small(),
            small(),
            any::<bool>(),
        )
            .prop_map(|(host, port, user, password, key, path, env, agent)| ConnectionOptions {
                host: host.to_string(),
                port,
                user: user.to_string(),
                password,
                private_key: key,
                private_key_path: path,
                private_key_env_var: env,
                agent,
                ..Default::default()
            })
    }

    type Fields = (
        String,
        u16,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        bool,
    );

    fn fields(o: &ConnectionOptions) -> Fields {
        (
            o.host.clone(),
            o.port,
            o.user.clone(),
            o.password.clone(),
            o.private_key.clone(),
            o.private_key_path.clone(),
            o.private_key_env_var.clone(),
            o.agent,
        )
    }

    proptest! {
        #[test]
        fn prop_identity_equal_iff_fields_equal(
            a in options(),
            b in options(),
            pa in proptest::option::of(options()),
            pb in proptest::option::of(options()),
        ) {
            let same = fields(&a) == fields(&b)
                && pa.as_ref().map(fields) == pb.as_ref().map(fields);
            let ia = ConnectionIdentity::new(&a, pa.as_ref());
            let ib = ConnectionIdentity::new(&b, pb.as_ref());
            prop_assert_eq!(ia == ib, same);
        }
    }
}
