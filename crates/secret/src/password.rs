use std::collections::BTreeMap;

use rand::Rng;

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";

const PASSWORD_LEN: usize = 16;
const PASSWORD_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Values handed to shell scripts must not be mistaken for option flags.
pub fn is_shell_safe(value: &str) -> bool {
    !value.starts_with('-')
}

/// Random 16-character password that never starts with `-`.
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: String = (0..PASSWORD_LEN)
            .map(|_| PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())] as char)
            .collect();
        if is_shell_safe(&candidate) {
            return candidate;
        }
    }
}

/// Data generator producing `{username: user, password: <fresh>}`.
pub fn user_password(user: &str) -> impl FnMut() -> BTreeMap<String, String> {
    let user = user.to_string();
    move || {
        BTreeMap::from([
            (USERNAME_KEY.to_string(), user.clone()),
            (PASSWORD_KEY.to_string(), generate_password()),
        ])
    }
}
