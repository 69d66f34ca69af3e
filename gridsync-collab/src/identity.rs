//! Client ids and display names.

use std::sync::Mutex;

/// Prefix for connection ids handed out by sessions.
pub const CLIENT_ID_PREFIX: &str = "user-";

/// Length of the random part of ids.
pub const ID_LENGTH: usize = 10;

const FIRST_NAMES: &[&str] = &[
    "Emma", "Noah", "Olivia", "Liam", "Ava", "William", "Sophia", "Mason", "Isabella", "James",
    "Mia", "Benjamin", "Charlotte", "Jacob", "Amelia",
];

/// Random `[a-zA-Z0-9]` string of `len` characters.
pub fn generate_id(len: usize) -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(len)
        .collect()
}

pub fn generate_client_id() -> String {
    format!("{CLIENT_ID_PREFIX}{}", generate_id(ID_LENGTH))
}

/// Display-name source.
///
/// Names repeat across a session, but two consecutive calls never return
/// the same name.
#[derive(Debug, Default)]
pub struct NameGenerator {
    previous: Mutex<Option<&'static str>>,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&self) -> &'static str {
        let mut previous = match self.previous.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let name = loop {
            let candidate = FIRST_NAMES[fastrand::usize(..FIRST_NAMES.len())];
            if *previous != Some(candidate) {
                break candidate;
            }
        };
        *previous = Some(name);
        name
    }
}
