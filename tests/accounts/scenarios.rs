//! BDD scenarios for ephemeral account management.

use rstest_bdd_macros::scenario;

use super::test_helpers::{AccountsWorld, accounts_world};

#[scenario(
    path = "tests/features/ephemeral_accounts.feature",
    name = "Purging removes only prefixed accounts"
)]
fn scenario_purge_prefixed(accounts_world: AccountsWorld) {
    drop(accounts_world);
}

#[scenario(
    path = "tests/features/ephemeral_accounts.feature",
    name = "A glob narrows the purge"
)]
fn scenario_glob_purge(accounts_world: AccountsWorld) {
    drop(accounts_world);
}

#[scenario(
    path = "tests/features/ephemeral_accounts.feature",
    name = "Recreating an account keeps its password"
)]
fn scenario_recreate_keeps_password(accounts_world: AccountsWorld) {
    drop(accounts_world);
}
