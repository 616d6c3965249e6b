//! OS account management.
//!
//! Account state is read from `/etc/passwd` and `/etc/group` on every call;
//! changes go through `useradd`, `usermod` and `userdel` so the host's own
//! tooling keeps shadow files and home directories consistent.

use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::error::{PlatformError, PlatformResult, fs_error, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Logical location of the account database.
pub const PASSWD_PATH: &str = "/etc/passwd";
/// Logical location of the group database.
pub const GROUP_PATH: &str = "/etc/group";

const MANAGED_KEY_BEGIN: &str = "# BEGIN hostkit managed key";
const MANAGED_KEY_END: &str = "# END hostkit managed key";
const LOCKED_PASSWORD: &str = "*";

/// Naming rules for managed accounts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountOptions {
    /// Account the agent itself runs management tasks as; never purged.
    pub control_user: String,
    /// Prefix every ephemeral account name carries.
    pub ephemeral_user_prefix: String,
    /// Login shell for created accounts.
    pub shell: String,
}

impl Default for AccountOptions {
    fn default() -> Self {
        Self {
            control_user: String::from("vcap"),
            ephemeral_user_prefix: String::from("bosh_"),
            shell: String::from("/bin/bash"),
        }
    }
}

/// One row of `/etc/passwd`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Account {
    /// Login name.
    pub name: String,
    /// Home directory.
    pub home: String,
    /// Login shell.
    pub shell: String,
}

/// Creates, reconciles and removes OS accounts.
#[derive(Clone, Debug)]
pub struct AccountManager<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    options: AccountOptions,
}

impl<R: CommandRunner, F: FileSystem> AccountManager<R, F> {
    /// Creates a manager.
    #[must_use]
    pub const fn new(runner: R, fs: F, paths: HostPaths, options: AccountOptions) -> Self {
        Self {
            runner,
            fs,
            paths,
            options,
        }
    }

    /// Returns the naming rules in force.
    #[must_use]
    pub const fn options(&self) -> &AccountOptions {
        &self.options
    }

    /// Lists accounts from `/etc/passwd`.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the database cannot be
    /// read.
    pub fn accounts(&self) -> PlatformResult<Vec<Account>> {
        let contents = self
            .fs
            .read_to_string(&self.paths.resolve(PASSWD_PATH))
            .map_err(fs_error("read account database"))?;
        Ok(contents.lines().filter_map(parse_passwd_line).collect())
    }

    fn find(&self, username: &str) -> PlatformResult<Option<Account>> {
        Ok(self
            .accounts()?
            .into_iter()
            .find(|account| account.name == username))
    }

    fn require(&self, username: &str) -> PlatformResult<Account> {
        self.find(username)?
            .ok_or_else(|| PlatformError::UnknownUser {
                username: username.to_owned(),
            })
    }

    fn group_members(&self) -> PlatformResult<BTreeMap<String, BTreeSet<String>>> {
        let contents = match self.fs.read_to_string(&self.paths.resolve(GROUP_PATH)) {
            Ok(contents) => contents,
            Err(err) if err.is_not_found() => return Ok(BTreeMap::new()),
            Err(err) => return Err(fs_error("read group database")(err)),
        };
        Ok(contents.lines().filter_map(parse_group_line).collect())
    }

    fn run_checked(&self, operation: &str, target: &str, program: &str, argv: Vec<String>) -> PlatformResult<()> {
        let output = self
            .runner
            .run(program, &args(argv))
            .map_err(runner_error(operation, target))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PlatformError::command_failed(operation, target, program, &output))
        }
    }

    /// Creates `username` with its home under `base_path`.
    ///
    /// An existing account keeps its password; only its shell is
    /// reconciled. A new account receives every supplied attribute.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] for an empty name and
    /// [`PlatformError::Collaborator`] when `useradd` or `usermod` fails.
    pub fn create_user(&self, username: &str, password: &str, base_path: &str) -> PlatformResult<()> {
        validate_username(username)?;
        if let Some(existing) = self.find(username)? {
            if existing.shell != self.options.shell {
                info!(user = username, shell = %self.options.shell, "reconciling login shell");
                self.run_checked(
                    "reconcile user",
                    username,
                    "usermod",
                    vec![
                        String::from("-s"),
                        self.options.shell.clone(),
                        username.to_owned(),
                    ],
                )?;
            }
            debug!(user = username, "account already exists; password left untouched");
            return Ok(());
        }

        let mut argv = vec![String::from("-m")];
        if !base_path.is_empty() {
            self.fs
                .create_dir_all(&self.paths.resolve(base_path))
                .map_err(fs_error("create home base"))?;
            argv.extend([String::from("-b"), base_path.to_owned()]);
        }
        argv.extend([String::from("-s"), self.options.shell.clone()]);
        if !password.is_empty() {
            argv.extend([String::from("-p"), password.to_owned()]);
        }
        argv.push(username.to_owned());
        info!(user = username, "creating account");
        self.run_checked("create user", username, "useradd", argv)
    }

    /// Adds `username` to each group in `groups` it is not yet a member of.
    /// Existing memberships are kept.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::UnknownUser`] when the account is missing.
    pub fn add_user_to_groups(&self, username: &str, groups: &[String]) -> PlatformResult<()> {
        self.require(username)?;
        let members = self.group_members()?;
        let missing: Vec<&str> = groups
            .iter()
            .map(String::as_str)
            .filter(|group| {
                !members
                    .get(*group)
                    .is_some_and(|names| names.contains(username))
            })
            .collect();
        if missing.is_empty() {
            debug!(user = username, "group memberships already in place");
            return Ok(());
        }
        info!(user = username, groups = %missing.join(","), "adding group memberships");
        self.run_checked(
            "add user to groups",
            username,
            "usermod",
            vec![
                String::from("-a"),
                String::from("-G"),
                missing.join(","),
                username.to_owned(),
            ],
        )
    }

    /// Deletes every ephemeral account whose name matches the glob
    /// `pattern` and returns how many were removed.
    ///
    /// Only names carrying the ephemeral prefix are eligible; the control
    /// account and `root` are never removed.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when `userdel` fails.
    pub fn delete_ephemeral_users_matching(&self, pattern: &str) -> PlatformResult<usize> {
        let doomed: Vec<String> = self
            .accounts()?
            .into_iter()
            .map(|account| account.name)
            .filter(|name| self.is_purgeable(name, pattern))
            .collect();
        for name in &doomed {
            info!(user = %name, "deleting ephemeral account");
            self.run_checked(
                "delete user",
                name,
                "userdel",
                vec![String::from("-r"), name.clone()],
            )?;
        }
        Ok(doomed.len())
    }

    fn is_purgeable(&self, name: &str, pattern: &str) -> bool {
        name != "root"
            && name != self.options.control_user
            && !self.options.ephemeral_user_prefix.is_empty()
            && name.starts_with(&self.options.ephemeral_user_prefix)
            && glob_matches(pattern, name)
    }

    /// Installs `public_key` as the agent-managed key of `username`.
    ///
    /// A previously managed key is replaced; keys outside the managed block
    /// are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::UnknownUser`] when the account is missing.
    pub fn setup_ssh(&self, public_key: &str, username: &str) -> PlatformResult<()> {
        let account = self.require(username)?;
        let ssh_dir = Utf8PathBuf::from(&account.home).join(".ssh");
        let keys_path = ssh_dir.join("authorized_keys");
        let resolved = self.paths.resolve(&keys_path);
        let current = match self.fs.read_to_string(&resolved) {
            Ok(contents) => contents,
            Err(err) if err.is_not_found() => String::new(),
            Err(err) => return Err(fs_error("read authorized keys")(err)),
        };
        let updated = replace_managed_key(&current, public_key.trim());
        if updated != current {
            info!(user = username, "installing managed ssh key");
            self.fs
                .write(&resolved, updated.as_bytes())
                .map_err(fs_error("write authorized keys"))?;
        }

        let owner = format!("{username}:{username}");
        self.run_checked(
            "own ssh dir",
            ssh_dir.as_str(),
            "chown",
            vec![String::from("-R"), owner, ssh_dir.to_string()],
        )?;
        self.run_checked(
            "protect ssh dir",
            ssh_dir.as_str(),
            "chmod",
            vec![String::from("0700"), ssh_dir.to_string()],
        )?;
        let keys = keys_path.into_string();
        self.run_checked(
            "protect authorized keys",
            &keys,
            "chmod",
            vec![String::from("0600"), keys.clone()],
        )
    }

    /// Sets an already-encrypted password hash. An empty hash locks the
    /// account.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::UnknownUser`] when the account is missing.
    pub fn set_user_password(&self, username: &str, encrypted: &str) -> PlatformResult<()> {
        self.require(username)?;
        let hash = if encrypted.is_empty() {
            LOCKED_PASSWORD
        } else {
            encrypted
        };
        self.run_checked(
            "set password",
            username,
            "usermod",
            vec![String::from("-p"), hash.to_owned(), username.to_owned()],
        )
    }
}

fn validate_username(username: &str) -> PlatformResult<()> {
    if username.trim().is_empty() || username.contains([':', '/', '\n']) {
        return Err(PlatformError::InvalidInput {
            field: String::from("username"),
            message: format!("{username:?} is not a valid account name"),
        });
    }
    Ok(())
}

fn parse_passwd_line(line: &str) -> Option<Account> {
    let mut fields = line.split(':');
    let name = fields.next().filter(|name| !name.is_empty())?;
    let mut rest = fields.skip(4);
    Some(Account {
        name: name.to_owned(),
        home: rest.next().unwrap_or_default().to_owned(),
        shell: rest.next().unwrap_or_default().to_owned(),
    })
}

fn parse_group_line(line: &str) -> Option<(String, BTreeSet<String>)> {
    let mut fields = line.split(':');
    let name = fields.next().filter(|name| !name.is_empty())?;
    let members = fields
        .nth(2)
        .unwrap_or_default()
        .split(',')
        .filter(|member| !member.is_empty())
        .map(str::to_owned)
        .collect();
    Some((name.to_owned(), members))
}

fn replace_managed_key(current: &str, public_key: &str) -> String {
    let mut kept = Vec::new();
    let mut in_block = false;
    for line in current.lines() {
        match line.trim() {
            MANAGED_KEY_BEGIN => in_block = true,
            MANAGED_KEY_END => in_block = false,
            _ if in_block => {}
            _ => kept.push(line),
        }
    }
    while kept.last().is_some_and(|line| line.trim().is_empty()) {
        kept.pop();
    }
    let mut updated = String::new();
    for line in kept {
        updated.push_str(line);
        updated.push('\n');
    }
    updated.push_str(MANAGED_KEY_BEGIN);
    updated.push('\n');
    updated.push_str(public_key);
    updated.push('\n');
    updated.push_str(MANAGED_KEY_END);
    updated.push('\n');
    updated
}

/// Matches `name` against a shell-style glob supporting `*` and `?`.
///
/// Runs in `O(pattern * name)` time: on a mismatch only the most recent `*`
/// is retried, one character further along `name`.
#[must_use]
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let name_chars: Vec<char> = name.chars().collect();
    let mut at_pattern = 0;
    let mut at_name = 0;
    let mut last_star: Option<(usize, usize)> = None;
    while let Some(actual) = name_chars.get(at_name) {
        match pattern_chars.get(at_pattern) {
            Some('*') => {
                last_star = Some((at_pattern, at_name));
                at_pattern += 1;
            }
            Some(expected) if *expected == '?' || expected == actual => {
                at_pattern += 1;
                at_name += 1;
            }
            _ => {
                let Some((star, consumed)) = last_star else {
                    return false;
                };
                last_star = Some((star, consumed + 1));
                at_pattern = star + 1;
                at_name = consumed + 1;
            }
        }
    }
    pattern_chars
        .get(at_pattern..)
        .is_some_and(|rest| rest.iter().all(|token| *token == '*'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("bosh_*", "bosh_abc", true)]
    #[case("bosh_?", "bosh_a", true)]
    #[case("bosh_?", "bosh_ab", false)]
    #[case("*", "anything", true)]
    #[case("bosh_x*z", "bosh_xyz", true)]
    #[case("bosh_x*z", "bosh_xyq", false)]
    #[case("", "bosh_a", false)]
    #[case("", "", true)]
    #[case("bosh_**", "bosh_", true)]
    #[case("bosh_*a?", "bosh_xaab", true)]
    #[case("bosh_*a?", "bosh_xab", true)]
    #[case("bosh_*a?", "bosh_xba", false)]
    #[case("*_*", "bosh_a", true)]
    fn glob_semantics(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(glob_matches(pattern, name), expected);
    }

    #[test]
    fn many_stars_against_a_long_name_finish_quickly() {
        let name = format!("bosh_{}", "a".repeat(28));
        let started = std::time::Instant::now();
        assert!(!glob_matches("bosh_*a*a*a*a*a*a*a*b", &name));
        assert!(glob_matches("bosh_*a*a*a*a*a*a*a*a", &name));
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
    }

    #[test]
    fn managed_key_replaces_previous_block_and_keeps_others() {
        let current = "ssh-rsa OPERATOR op@host\n# BEGIN hostkit managed key\nssh-rsa OLD\n# END hostkit managed key\n";
        let updated = replace_managed_key(current, "ssh-rsa NEW");
        assert_eq!(
            updated,
            "ssh-rsa OPERATOR op@host\n# BEGIN hostkit managed key\nssh-rsa NEW\n# END hostkit managed key\n"
        );
        assert_eq!(replace_managed_key(&updated, "ssh-rsa NEW"), updated);
    }

    #[test]
    fn parses_passwd_and_group_rows() {
        let account = parse_passwd_line("vcap:x:1000:1000:,,,:/home/vcap:/bin/bash")
            .unwrap_or_else(|| panic!("row should parse"));
        assert_eq!(account.home, "/home/vcap");
        assert_eq!(account.shell, "/bin/bash");

        let (group, members) =
            parse_group_line("admin:x:27:vcap,bosh_x").unwrap_or_else(|| panic!("row should parse"));
        assert_eq!(group, "admin");
        assert!(members.contains("bosh_x"));
    }
}
