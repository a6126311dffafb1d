//! Environment-variable merge rules (§4.3, §9).
//!
//! The composer assembles a container's environment in two layers: the
//! operator-computed defaults (session identity, credentials, object-store
//! config, ...) and the user-supplied `environmentVariables` from the
//! session spec. User values are meant to win, with one asymmetric
//! exception: an operator default sourced via `ValueFrom` (almost always a
//! secret reference) can never be shadowed by a plain user-supplied value for
//! the same name, because the runtime enforces that binding regardless of
//! what the controller would otherwise render. The composer has to encode
//! that rule itself rather than rely on however the kubelet would resolve
//! duplicate names.

use k8s_openapi::api::core::v1::EnvVar;
use std::collections::HashMap;

/// Merges `user_env` into `operator_env`, preserving `operator_env`'s order
/// and appending genuinely new keys from `user_env` at the end. Deterministic
/// for a given input: no wall-clock or iteration-order-dependent state.
pub fn merge_env(operator_env: Vec<EnvVar>, user_env: Vec<EnvVar>) -> Vec<EnvVar> {
    let mut result = operator_env;
    let mut index_of: HashMap<String, usize> = result
        .iter()
        .enumerate()
        .map(|(i, e)| (e.name.clone(), i))
        .collect();

    for entry in user_env {
        match index_of.get(&entry.name) {
            Some(&i) if result[i].value_from.is_some() => {
                // Operator default is secret-sourced; the user cannot override it.
            }
            Some(&i) => {
                result[i] = entry;
            }
            None => {
                index_of.insert(entry.name.clone(), result.len());
                result.push(entry);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EnvVarSource, SecretKeySelector};

    fn plain(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    fn secret_ref(name: &str, secret: &str, key: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.to_string(),
                    key: key.to_string(),
                    optional: None,
                }),
                ..EnvVarSource::default()
            }),
        }
    }

    #[test]
    fn user_plain_value_overrides_operator_plain_default() {
        let operator = vec![plain("MODEL", "default-model")];
        let user = vec![plain("MODEL", "override-model")];
        let merged = merge_env(operator, user);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value.as_deref(), Some("override-model"));
    }

    #[test]
    fn operator_value_from_cannot_be_overridden_by_user_plain_value() {
        let operator = vec![secret_ref("BEARER_TOKEN", "sess-token", "token")];
        let user = vec![plain("BEARER_TOKEN", "attacker-supplied")];
        let merged = merge_env(operator, user);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].value_from.is_some());
        assert!(merged[0].value.is_none());
    }

    #[test]
    fn new_user_keys_are_appended_after_operator_defaults() {
        let operator = vec![plain("SESSION_NAME", "s-1")];
        let user = vec![plain("MY_EXTRA", "x")];
        let merged = merge_env(operator, user);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "SESSION_NAME");
        assert_eq!(merged[1].name, "MY_EXTRA");
    }

    #[test]
    fn merge_is_deterministic_across_repeated_calls() {
        let operator = vec![
            plain("A", "1"),
            secret_ref("B", "sess-token", "token"),
            plain("C", "3"),
        ];
        let user = vec![plain("B", "nope"), plain("C", "3-override"), plain("D", "4")];

        let first = merge_env(operator.clone(), user.clone());
        let second = merge_env(operator, user);
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["A", "B", "C", "D"]
        );
        assert_eq!(first[1].value_from.is_some(), true);
        assert_eq!(first[2].value.as_deref(), Some("3-override"));
    }
}
