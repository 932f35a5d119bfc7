use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Credential lookup used by the optional login flow. Implementations must
/// be safe to call from concurrent target workers.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, target: &str, key: &str) -> Option<String>;
}

/// Reads `<PREFIX>_<TARGET>_<KEY>` from the process environment, with the
/// target and key uppercased and non-alphanumerics mapped to underscores.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    prefix: String,
}

impl EnvCredentials {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn variable(&self, target: &str, key: &str) -> String {
        format!(
            "{}_{}_{}",
            self.prefix,
            sanitize(target),
            sanitize(key)
        )
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("PATROL")
    }
}

impl CredentialStore for EnvCredentials {
    fn resolve(&self, target: &str, key: &str) -> Option<String> {
        std::env::var(self.variable(target, key)).ok()
    }
}

/// Reads `<root>/<target>/<key>` files, trimming trailing whitespace.
/// Compatible with directory-mounted secrets.
#[derive(Debug, Clone)]
pub struct DirCredentials {
    root: PathBuf,
}

impl DirCredentials {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CredentialStore for DirCredentials {
    fn resolve(&self, target: &str, key: &str) -> Option<String> {
        let path = self.root.join(target).join(key);
        std::fs::read_to_string(path)
            .ok()
            .map(|value| value.trim_end().to_string())
    }
}

/// Tries each store in order and returns the first hit.
pub struct ChainedCredentials {
    stores: Vec<Arc<dyn CredentialStore>>,
}

impl ChainedCredentials {
    pub fn new(stores: Vec<Arc<dyn CredentialStore>>) -> Self {
        Self { stores }
    }
}

impl fmt::Debug for ChainedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedCredentials")
            .field("stores", &self.stores.len())
            .finish()
    }
}

impl CredentialStore for ChainedCredentials {
    fn resolve(&self, target: &str, key: &str) -> Option<String> {
        self.stores
            .iter()
            .find_map(|store| store.resolve(target, key))
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_variable_name_is_sanitized() {
        let store = EnvCredentials::new("PATROL");
        assert_eq!(
            store.variable("my-shop", "api.user"),
            "PATROL_MY_SHOP_API_USER"
        );
    }

    #[test]
    fn dir_credentials_read_and_trim() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("shop");
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(target_dir.join("USERNAME"), "alice\n").unwrap();

        let store = DirCredentials::new(dir.path());
        assert_eq!(store.resolve("shop", "USERNAME").as_deref(), Some("alice"));
        assert_eq!(store.resolve("shop", "PASSWORD"), None);
    }

    #[test]
    fn chained_credentials_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("shop");
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(target_dir.join("TOKEN"), "from-file").unwrap();

        let chain = ChainedCredentials::new(vec![
            Arc::new(EnvCredentials::new("PATROL_TEST_UNSET")),
            Arc::new(DirCredentials::new(dir.path())),
        ]);
        assert_eq!(chain.resolve("shop", "TOKEN").as_deref(), Some("from-file"));
        assert_eq!(chain.resolve("shop", "MISSING"), None);
    }
}
