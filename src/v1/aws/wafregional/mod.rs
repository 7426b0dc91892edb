pub mod ip_set;
pub mod rule;

use anyhow::anyhow;
use aws_sdk_wafregional::{
    error::{ProvideErrorMetadata, SdkError},
    Client,
};
use std::{collections::HashSet, hash::Hash};

use crate::v1::token::{ChangeTokenSource, ErrorClass};

const STALE_DATA_CODE: &str = "WAFStaleDataException";
const NONEXISTENT_ITEM_CODE: &str = "WAFNonexistentItemException";

impl ChangeTokenSource for Client {
    async fn change_token(&self) -> Result<String, anyhow::Error> {
        let out = self
            .get_change_token()
            .send()
            .await
            .map_err(|e| anyhow!("{:?}", e.into_source()))?;
        out.change_token
            .ok_or_else(|| anyhow!("service returned an empty change token"))
    }
}

/// Classifier for [`ChangeTokenRetryer::retry_with_token`]: only the stale
/// change-token rejection is retryable, everything else is terminal.
///
/// [`ChangeTokenRetryer::retry_with_token`]: crate::v1::token::ChangeTokenRetryer::retry_with_token
pub fn stale_data<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> ErrorClass {
    match err.as_service_error().and_then(|e| e.code()) {
        Some(STALE_DATA_CODE) => ErrorClass::StaleToken,
        _ => ErrorClass::Other,
    }
}

pub fn is_not_found<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    err.as_service_error().and_then(|e| e.code()) == Some(NONEXISTENT_ITEM_CODE)
}

/// Computes the update actions turning `current` into `desired`, treating both
/// as unordered sets: inserts are desired-minus-current, deletes
/// current-minus-desired.
pub fn set_updates<'a, T: Eq + Hash>(
    current: &'a [T],
    desired: &'a [T],
) -> (Vec<&'a T>, Vec<&'a T>) {
    let current_set: HashSet<&T> = current.iter().collect();
    let desired_set: HashSet<&T> = desired.iter().collect();
    let inserts = desired
        .iter()
        .filter(|item| !current_set.contains(item))
        .collect();
    let deletes = current
        .iter()
        .filter(|item| !desired_set.contains(item))
        .collect();
    (inserts, deletes)
}

#[cfg(test)]
mod tests {
    use super::set_updates;

    #[test]
    fn disjoint_lists_replace_everything() {
        let current = vec!["10.0.0.0/8"];
        let desired = vec!["192.0.2.0/24", "198.51.100.0/24"];
        let (inserts, deletes) = set_updates(&current, &desired);
        assert_eq!(inserts, vec![&"192.0.2.0/24", &"198.51.100.0/24"]);
        assert_eq!(deletes, vec![&"10.0.0.0/8"]);
    }

    #[test]
    fn overlap_is_left_untouched() {
        let current = vec!["a", "b", "c"];
        let desired = vec!["c", "b", "d"];
        let (inserts, deletes) = set_updates(&current, &desired);
        assert_eq!(inserts, vec![&"d"]);
        assert_eq!(deletes, vec![&"a"]);
    }

    #[test]
    fn identical_lists_need_no_updates() {
        let current = vec![1, 2, 3];
        let desired = vec![3, 2, 1];
        let (inserts, deletes) = set_updates(&current, &desired);
        assert!(inserts.is_empty());
        assert!(deletes.is_empty());
    }

    #[test]
    fn empty_desired_deletes_all() {
        let current = vec![1, 2];
        let desired: Vec<i32> = vec![];
        let (inserts, deletes) = set_updates(&current, &desired);
        assert!(inserts.is_empty());
        assert_eq!(deletes, vec![&1, &2]);
    }
}
