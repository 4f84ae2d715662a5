//! Path and name helpers.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

const PASSWD_FILE: &str = "/etc/passwd";

/// Expand a leading `~` or `~user` of a data directory path to the home
/// directory of the current or named user.
///
/// The current user's home is `$HOME`, or the account database entry when
/// `$HOME` is unset or empty.
pub fn expand_data_dir(path: &str) -> Result<PathBuf> {
    expand_with(path, dirs::home_dir, |user| {
        let passwd = std::fs::read_to_string(PASSWD_FILE)
            .with_context(|| format!("could not expand ~{}: failed to read {}", user, PASSWD_FILE))?;
        home_from_passwd(&passwd, user)
            .ok_or_else(|| anyhow!("could not expand ~{}: unknown user", user))
    })
}

fn expand_with(
    path: &str,
    current_home: impl FnOnce() -> Option<PathBuf>,
    user_home: impl FnOnce(&str) -> Result<PathBuf>,
) -> Result<PathBuf> {
    let Some(rest) = path.strip_prefix('~') else {
        return Ok(PathBuf::from(path));
    };
    let (user, tail) = rest.split_once('/').unwrap_or((rest, ""));

    let home = if user.is_empty() {
        current_home()
            .filter(|h| !h.as_os_str().is_empty())
            .ok_or_else(|| anyhow!("could not expand ~: empty home directory"))?
    } else {
        user_home(user)?
    };

    if home.as_os_str().is_empty() {
        return Err(anyhow!("could not expand ~{}: empty home directory", user));
    }

    let tail = tail.trim_start_matches('/');
    Ok(if tail.is_empty() { home } else { home.join(tail) })
}

/// Home directory of `user` in passwd(5) content.
fn home_from_passwd(passwd: &str, user: &str) -> Option<PathBuf> {
    passwd
        .lines()
        .filter(|l| !l.starts_with('#'))
        .map(|l| l.split(':').collect::<Vec<_>>())
        .find(|fields| fields.len() >= 6 && fields[0] == user)
        .map(|fields| PathBuf::from(fields[5]))
}

/// Whether `name` can be used as an image or environment name: non-empty,
/// made of ASCII alphanumerics, `-` and `.`, and not starting with a dot.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
# local accounts
root:x:0:0:root:/root:/bin/bash
jdoe:x:1000:1000:John Doe:/home/jdoe:/bin/zsh
nohome:x:1001:1001::/:/usr/sbin/nologin
";

    fn home() -> Option<PathBuf> {
        Some(PathBuf::from("/home/jdoe"))
    }

    fn lookup(user: &str) -> Result<PathBuf> {
        home_from_passwd(PASSWD, user).ok_or_else(|| anyhow!("unknown user {}", user))
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(
            expand_with("~/.local/share/carcass", home, lookup).unwrap(),
            PathBuf::from("/home/jdoe/.local/share/carcass")
        );
        assert_eq!(expand_with("~", home, lookup).unwrap(), PathBuf::from("/home/jdoe"));
        assert_eq!(
            expand_with("/srv/carcass", home, lookup).unwrap(),
            PathBuf::from("/srv/carcass")
        );
        assert!(expand_with("~/x", || None, lookup).is_err());
        assert!(expand_with("~/x", || Some(PathBuf::new()), lookup).is_err());
    }

    #[test]
    fn test_expand_tilde_user() {
        assert_eq!(
            expand_with("~root/carcass", home, lookup).unwrap(),
            PathBuf::from("/root/carcass")
        );
        assert_eq!(expand_with("~jdoe", home, lookup).unwrap(), PathBuf::from("/home/jdoe"));

        let err = expand_with("~ghost/x", home, lookup).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_home_from_passwd() {
        assert_eq!(home_from_passwd(PASSWD, "nohome"), Some(PathBuf::from("/")));
        assert_eq!(home_from_passwd(PASSWD, "# local accounts"), None);
        assert_eq!(home_from_passwd(PASSWD, "jd"), None);
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("debian11"));
        assert!(is_valid_name("rocky-9.2"));
        assert!(!is_valid_name("rocky_9"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".hidden"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name("with space"));
    }
}
