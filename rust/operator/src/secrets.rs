//! Maps secret and config map key references to the paths they are mounted at inside the
//! collector container, and reads the credential shape of output secrets.

use std::{collections::BTreeMap, sync::LazyLock};

use k8s_openapi::api::core::v1::Secret;
use log_forwarder_crd::{ConfigMapOrSecretKey, SecretKey};
use regex::Regex;

pub const SECRETS_MOUNT_ROOT: &str = "/var/run/ocp-collector/secrets";
pub const CONFIG_MAPS_MOUNT_ROOT: &str = "/var/run/ocp-collector/config";

/// Holds a credentials file, e.g. an AWS shared credentials profile with a `role_arn`.
pub const CREDENTIALS_KEY: &str = "credentials";
/// Holds nothing but the ARN of the role to assume.
pub const ROLE_ARN_KEY: &str = "role_arn";

pub const AWS_ACCESS_KEY_ID_KEY: &str = "aws_access_key_id";
pub const AWS_SECRET_ACCESS_KEY_KEY: &str = "aws_secret_access_key";
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const TOKEN_KEY: &str = "token";

static ROLE_ARN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"arn:aws(.*)?:(iam|sts)::\d{12}:role/\S+").expect("role ARN pattern is valid")
});

/// Output secrets keyed by output name. At most one secret per output.
pub type OutputSecrets = BTreeMap<String, Secret>;

/// How a secret delivers federated (STS) cloud credentials.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialShape {
    /// A credentials file that embeds the role ARN.
    Bundled,
    /// A bare role ARN.
    RoleOnly,
    None,
}

pub fn secret_path(secret_name: &str, key: &str) -> String {
    if secret_name.is_empty() || key.is_empty() {
        return String::new();
    }
    format!("{SECRETS_MOUNT_ROOT}/{secret_name}/{key}")
}

pub fn config_map_path(config_map_name: &str, key: &str) -> String {
    if config_map_name.is_empty() || key.is_empty() {
        return String::new();
    }
    format!("{CONFIG_MAPS_MOUNT_ROOT}/{config_map_name}/{key}")
}

pub fn secret_key_path(reference: Option<&SecretKey>) -> String {
    reference
        .map(|reference| secret_path(&reference.secret_name, &reference.key))
        .unwrap_or_default()
}

/// Resolves a key that may live in either a secret or a config map; the secret wins.
pub fn config_map_or_secret_path(reference: Option<&ConfigMapOrSecretKey>) -> String {
    let Some(reference) = reference else {
        return String::new();
    };
    match (&reference.secret_name, &reference.config_map_name) {
        (Some(secret_name), _) if !secret_name.is_empty() => {
            secret_path(secret_name, &reference.key)
        }
        (_, Some(config_map_name)) => config_map_path(config_map_name, &reference.key),
        _ => String::new(),
    }
}

/// Reads a key of the secret as UTF-8 text.
pub fn value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
}

pub fn has_key(secret: &Secret, key: &str) -> bool {
    secret
        .data
        .as_ref()
        .is_some_and(|data| data.contains_key(key))
}

pub fn credential_shape(secret: &Secret) -> CredentialShape {
    if has_key(secret, CREDENTIALS_KEY) {
        CredentialShape::Bundled
    } else if has_key(secret, ROLE_ARN_KEY) {
        CredentialShape::RoleOnly
    } else {
        CredentialShape::None
    }
}

/// The role to assume, taken from the bundled credentials first and the bare role key second.
pub fn role_arn(secret: &Secret) -> Option<String> {
    match credential_shape(secret) {
        CredentialShape::Bundled => value(secret, CREDENTIALS_KEY).and_then(|credentials| {
            ROLE_ARN_PATTERN
                .find(&credentials)
                .map(|found| found.as_str().to_string())
        }),
        CredentialShape::RoleOnly => value(secret, ROLE_ARN_KEY),
        CredentialShape::None => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::ByteString;
    use rstest::rstest;

    use super::*;

    pub(crate) const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/my-role-to-assume";

    pub(crate) fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(key, value)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Secret::default()
        }
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            secret_path("my-secret", "tls.crt"),
            "/var/run/ocp-collector/secrets/my-secret/tls.crt"
        );
        assert_eq!(
            config_map_path("my-cm", "ca.crt"),
            "/var/run/ocp-collector/config/my-cm/ca.crt"
        );
        assert_eq!(secret_key_path(None), "");
        assert_eq!(config_map_or_secret_path(None), "");
        assert_eq!(secret_path("", "tls.crt"), "");
    }

    #[rstest]
    #[case(Some("sec"), Some("cm"), "/var/run/ocp-collector/secrets/sec/ca.crt")]
    #[case(None, Some("cm"), "/var/run/ocp-collector/config/cm/ca.crt")]
    #[case(Some(""), Some("cm"), "/var/run/ocp-collector/config/cm/ca.crt")]
    #[case(None, None, "")]
    fn test_secret_wins_over_config_map(
        #[case] secret_name: Option<&str>,
        #[case] config_map_name: Option<&str>,
        #[case] expected: &str,
    ) {
        let reference = ConfigMapOrSecretKey {
            secret_name: secret_name.map(str::to_string),
            config_map_name: config_map_name.map(str::to_string),
            key: "ca.crt".to_string(),
        };
        assert_eq!(config_map_or_secret_path(Some(&reference)), expected);
    }

    #[rstest]
    #[case(&[(CREDENTIALS_KEY, ROLE_ARN)], CredentialShape::Bundled)]
    #[case(&[(ROLE_ARN_KEY, ROLE_ARN)], CredentialShape::RoleOnly)]
    #[case(&[(CREDENTIALS_KEY, ROLE_ARN), (ROLE_ARN_KEY, "other")], CredentialShape::Bundled)]
    #[case(&[("aws_access_key_id", "AKIA")], CredentialShape::None)]
    #[case(&[], CredentialShape::None)]
    fn test_credential_shape(#[case] data: &[(&str, &str)], #[case] expected: CredentialShape) {
        assert_eq!(credential_shape(&secret("cw", data)), expected);
    }

    #[test]
    fn test_role_arn_from_credentials_profile() {
        let profile = format!(
            "[default]\nrole_arn = {ROLE_ARN}\nweb_identity_token_file = /var/run/secrets/token\n"
        );
        let bundled = secret("cw", &[(CREDENTIALS_KEY, &profile), (ROLE_ARN_KEY, "ignored")]);
        assert_eq!(role_arn(&bundled).as_deref(), Some(ROLE_ARN));

        let role_only = secret("cw", &[(ROLE_ARN_KEY, ROLE_ARN)]);
        assert_eq!(role_arn(&role_only).as_deref(), Some(ROLE_ARN));

        assert_eq!(role_arn(&secret("cw", &[])), None);
    }
}
