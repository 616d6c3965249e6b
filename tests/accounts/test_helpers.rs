//! Shared fixtures for account BDD scenarios.

use std::cell::Cell;

use camino::Utf8PathBuf;
use hostkit::test_support::SimulatedHost;
use hostkit::{AccountManager, AccountOptions, HostFileSystem};
use rstest::fixture;
use tempfile::TempDir;

pub struct AccountsWorld {
    pub host: SimulatedHost,
    pub manager: AccountManager<SimulatedHost, HostFileSystem>,
    pub purged: Cell<Option<usize>>,
    _root: TempDir,
}

impl AccountsWorld {
    pub fn has_account(&self, name: &str) -> bool {
        let prefix = format!("{name}:");
        self.host
            .read_file("/etc/passwd")
            .unwrap_or_default()
            .lines()
            .any(|row| row.starts_with(&prefix))
    }
}

pub fn names(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|name| !name.is_empty())
}

#[fixture]
pub fn accounts_world() -> AccountsWorld {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("create host root: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("host root is not UTF-8: {}", path.display()));
    let host = SimulatedHost::new(root).unwrap_or_else(|err| panic!("seed host: {err}"));
    let manager = AccountManager::new(
        host.clone(),
        HostFileSystem,
        host.paths(),
        AccountOptions::default(),
    );
    AccountsWorld {
        host,
        manager,
        purged: Cell::new(None),
        _root: tmp,
    }
}
