use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};

use tracing::*;

use crate::{FishlerConfig, FishlerError, Secret};

/// What the honeypot accepts as a "valid" credential. Exactly one variant is
/// active, chosen by the mutually exclusive auth selectors at startup.
#[derive(Debug, Clone)]
pub enum AuthPolicy {
    DenyAll,
    AllowAll,
    SinglePassword(Secret<String>),
    SingleAccount {
        username: String,
        password: Secret<String>,
    },
    PasswordList(HashSet<String>),
    AccountMap(HashMap<String, HashSet<String>>),
}

impl AuthPolicy {
    /// Validates the selector flags and loads any credential files.
    /// Conflicting or missing selectors are fatal here, not at auth time.
    pub fn from_config(config: &FishlerConfig) -> Result<Self, FishlerError> {
        let selectors: [(&'static str, bool); 6] = [
            ("account-file", !config.account_file.is_empty()),
            ("password-file", !config.password_file.is_empty()),
            ("account", !config.account.is_empty()),
            ("password", !config.password.is_empty()),
            ("any-account", config.any_account),
            ("no-account", config.no_account),
        ];

        let mut active = selectors.iter().filter(|(_, set)| *set);
        let Some(first) = active.next() else {
            return Err(FishlerError::NoAuthOption);
        };
        if let Some(second) = active.next() {
            return Err(FishlerError::ConflictingAuthOptions(first.0, second.0));
        }

        Ok(match first.0 {
            "no-account" => AuthPolicy::DenyAll,
            "any-account" => AuthPolicy::AllowAll,
            "password" => AuthPolicy::SinglePassword(Secret::new(config.password.clone())),
            "account" => {
                let (username, password) = config.account.split_once(',').ok_or_else(|| {
                    FishlerError::Configuration(format!(
                        "account must be username,password: {:?}",
                        config.account
                    ))
                })?;
                AuthPolicy::SingleAccount {
                    username: username.to_owned(),
                    password: Secret::new(password.to_owned()),
                }
            }
            "password-file" => AuthPolicy::PasswordList(load_password_file(&config.password_file)?),
            "account-file" => AuthPolicy::AccountMap(load_account_file(&config.account_file)?),
            _ => unreachable!(),
        })
    }

    /// First match wins; no credential source configured means no access.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        match self {
            AuthPolicy::DenyAll => false,
            AuthPolicy::AllowAll => true,
            AuthPolicy::SinglePassword(p) => p.expose_secret() == password,
            AuthPolicy::SingleAccount {
                username: u,
                password: p,
            } => u == username && p.expose_secret() == password,
            AuthPolicy::PasswordList(passwords) => {
                !passwords.is_empty() && passwords.contains(password)
            }
            AuthPolicy::AccountMap(accounts) => {
                !accounts.is_empty()
                    && accounts
                        .get(username)
                        .map(|passwords| passwords.contains(password))
                        .unwrap_or(false)
            }
        }
    }
}

fn load_password_file(path: &str) -> Result<HashSet<String>, FishlerError> {
    let file = File::open(path)?;
    let mut passwords = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.is_empty() {
            passwords.insert(line);
        }
    }
    debug!(count = passwords.len(), path, "loaded password file");
    Ok(passwords)
}

fn load_account_file(path: &str) -> Result<HashMap<String, HashSet<String>>, FishlerError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(FishlerError::other)?;

    let mut accounts: HashMap<String, HashSet<String>> = HashMap::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(FishlerError::other)?;
        if record.len() != 2 {
            warn!(line = index + 1, path, "skipping malformed account row");
            continue;
        }
        accounts
            .entry(record[0].to_owned())
            .or_default()
            .insert(record[1].to_owned());
    }
    debug!(count = accounts.len(), path, "loaded account file");
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn config() -> FishlerConfig {
        FishlerConfig::default()
    }

    #[test]
    fn exactly_one_selector_required() {
        assert!(matches!(
            AuthPolicy::from_config(&config()),
            Err(FishlerError::NoAuthOption)
        ));

        let mut c = config();
        c.any_account = true;
        c.no_account = true;
        assert!(matches!(
            AuthPolicy::from_config(&c),
            Err(FishlerError::ConflictingAuthOptions(_, _))
        ));
    }

    #[test]
    fn deny_and_allow_all() {
        assert!(!AuthPolicy::DenyAll.authenticate("root", "toor"));
        assert!(AuthPolicy::AllowAll.authenticate("root", ""));
    }

    #[test]
    fn single_password_matches_any_user() {
        let policy = AuthPolicy::SinglePassword(Secret::new("hunter2".into()));
        assert!(policy.authenticate("alice", "hunter2"));
        assert!(policy.authenticate("bob", "hunter2"));
        assert!(!policy.authenticate("alice", "hunter3"));
    }

    #[test]
    fn account_map_is_fail_closed() {
        let policy = AuthPolicy::AccountMap(HashMap::new());
        assert!(!policy.authenticate("anyone", "anything"));

        let mut accounts = HashMap::new();
        accounts.insert("carol".to_owned(), HashSet::from(["pw".to_owned()]));
        let policy = AuthPolicy::AccountMap(accounts);
        assert!(policy.authenticate("carol", "pw"));
        assert!(!policy.authenticate("carol", "other"));
        assert!(!policy.authenticate("mallory", "pw"));
    }

    #[test]
    fn empty_password_list_rejects() {
        let policy = AuthPolicy::PasswordList(HashSet::new());
        assert!(!policy.authenticate("u", "p"));
    }

    #[test]
    fn loads_account_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice,secret").unwrap();
        writeln!(file, "alice,hunter2").unwrap();
        writeln!(file, "bob,letmein").unwrap();
        writeln!(file, "broken-row").unwrap();

        let mut c = config();
        c.account_file = file.path().to_string_lossy().into_owned();
        let policy = AuthPolicy::from_config(&c).unwrap();
        assert!(policy.authenticate("alice", "secret"));
        assert!(policy.authenticate("alice", "hunter2"));
        assert!(policy.authenticate("bob", "letmein"));
        assert!(!policy.authenticate("bob", "secret"));
    }

    #[test]
    fn loads_password_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "123456").unwrap();
        writeln!(file, "password").unwrap();

        let mut c = config();
        c.password_file = file.path().to_string_lossy().into_owned();
        let policy = AuthPolicy::from_config(&c).unwrap();
        assert!(policy.authenticate("whoever", "123456"));
        assert!(!policy.authenticate("whoever", "1234567"));
    }
}
