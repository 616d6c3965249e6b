//! BDD step definitions for ephemeral account management.

use hostkit::PlatformError;
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{AccountsWorld, names};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a host with accounts \"{accounts}\"")]
fn host_with_accounts(accounts_world: &AccountsWorld, accounts: String) -> Result<(), StepError> {
    for name in names(&accounts) {
        accounts_world.manager.create_user(name, "", "")?;
    }
    Ok(())
}

#[given("a host with account \"{name}\" using password \"{password}\"")]
fn host_with_password(
    accounts_world: &AccountsWorld,
    name: String,
    password: String,
) -> Result<(), StepError> {
    accounts_world.manager.create_user(&name, &password, "")?;
    Ok(())
}

#[when("ephemeral accounts matching \"{pattern}\" are purged")]
fn purge(accounts_world: &AccountsWorld, pattern: String) -> Result<(), StepError> {
    let removed = accounts_world
        .manager
        .delete_ephemeral_users_matching(&pattern)?;
    accounts_world.purged.set(Some(removed));
    Ok(())
}

#[when("account \"{name}\" is created again with password \"{password}\"")]
fn recreate(accounts_world: &AccountsWorld, name: String, password: String) -> Result<(), StepError> {
    accounts_world.manager.create_user(&name, &password, "")?;
    Ok(())
}

#[then("\"{count}\" accounts were purged")]
fn purged_count(accounts_world: &AccountsWorld, count: usize) -> Result<(), StepError> {
    match accounts_world.purged.get() {
        Some(removed) if removed == count => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {count} purged accounts, got {other:?}"
        ))),
    }
}

#[then("accounts \"{accounts}\" remain")]
fn accounts_remain(accounts_world: &AccountsWorld, accounts: String) -> Result<(), StepError> {
    match names(&accounts).find(|name| !accounts_world.has_account(name)) {
        Some(missing) => Err(StepError::Assertion(format!("{missing} was removed"))),
        None => Ok(()),
    }
}

#[then("accounts \"{accounts}\" are gone")]
fn accounts_gone(accounts_world: &AccountsWorld, accounts: String) -> Result<(), StepError> {
    match names(&accounts).find(|name| accounts_world.has_account(name)) {
        Some(survivor) => Err(StepError::Assertion(format!("{survivor} survived the purge"))),
        None => Ok(()),
    }
}

#[then("account \"{name}\" has password \"{password}\"")]
fn has_password(accounts_world: &AccountsWorld, name: String, password: String) -> Result<(), StepError> {
    let recorded = accounts_world.host.password_of(&name);
    if recorded.as_deref() == Some(password.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected password {password} for {name}, found {recorded:?}"
        )))
    }
}
