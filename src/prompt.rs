use std::io::Write;

/// "May I proceed" decisions. The scanner and visitor ask before spending
/// quota or touching the network; `--yes` swaps in the bypass.
pub trait Confirmer {
    fn confirm(&self, message: &str) -> bool;
}

/// Interactive y/n prompt on stdin.
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, message: &str) -> bool {
        print!("{message} (y/n): ");
        let _ = std::io::stdout().flush();

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input).is_err() {
            return false;
        }
        input.trim().eq_ignore_ascii_case("y")
    }
}

/// Always answers yes; used when `--yes` is set.
pub struct ForceConfirmer;

impl Confirmer for ForceConfirmer {
    fn confirm(&self, _message: &str) -> bool {
        true
    }
}

#[cfg(test)]
pub struct DenyConfirmer;

#[cfg(test)]
impl Confirmer for DenyConfirmer {
    fn confirm(&self, _message: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_confirmer_always_yes() {
        assert!(ForceConfirmer.confirm("Proceed?"));
    }
}
