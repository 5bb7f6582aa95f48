use std::collections::BTreeSet;

use tracing::info;

use crate::{error::PlacerError, ui::Prompt};

/// Decides whether an existing file inside the image may be replaced.
///
/// Keys are image-absolute paths (`/opt/app/bin/app`). Interactive runs ask
/// and remember the answer in `allowed`, so a saved configuration replays the
/// same decisions; non-interactive runs only accept what is already listed.
pub struct OverwritePolicy<'a> {
    interactive: bool,
    prompt: &'a dyn Prompt,
    allowed: &'a mut BTreeSet<String>,
}

impl<'a> OverwritePolicy<'a> {
    pub fn new(interactive: bool, prompt: &'a dyn Prompt, allowed: &'a mut BTreeSet<String>) -> Self {
        Self {
            interactive,
            prompt,
            allowed,
        }
    }

    pub fn check(&mut self, image_path: &str) -> Result<(), PlacerError> {
        if self.allowed.contains(image_path) {
            return Ok(());
        }

        if !self.interactive {
            return Err(PlacerError::OverwriteRefused {
                path: image_path.to_string(),
                reason: "is not in the overwrite list",
            });
        }

        let question = format!("File {} already exists. Do you want to overwrite it?", image_path);
        if self.prompt.confirm(&question)? {
            info!(path = image_path, "overwrite approved");
            self.allowed.insert(image_path.to_string());
            Ok(())
        } else {
            Err(PlacerError::OverwriteRefused {
                path: image_path.to_string(),
                reason: "user chose not to overwrite it",
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedPrompt;

    #[test]
    fn test_listed_path_is_allowed_without_asking() {
        let prompt = ScriptedPrompt::panicking();
        let mut allowed: BTreeSet<String> = ["/opt/a".to_string()].into();
        let mut policy = OverwritePolicy::new(true, &prompt, &mut allowed);
        assert!(policy.check("/opt/a").is_ok());
    }

    #[test]
    fn test_non_interactive_rejects_unlisted() {
        let prompt = ScriptedPrompt::panicking();
        let mut allowed = BTreeSet::new();
        let mut policy = OverwritePolicy::new(false, &prompt, &mut allowed);
        let err = policy.check("/opt/a").unwrap_err();
        assert!(err.to_string().contains("not in the overwrite list"));
    }

    #[test]
    fn test_interactive_approval_is_recorded() {
        let prompt = ScriptedPrompt::answers(&[true]);
        let mut allowed = BTreeSet::new();
        {
            let mut policy = OverwritePolicy::new(true, &prompt, &mut allowed);
            policy.check("/opt/a").unwrap();
            // second check for the same path does not ask again
            policy.check("/opt/a").unwrap();
        }
        assert!(allowed.contains("/opt/a"));
        assert_eq!(prompt.asked(), 1);
    }

    #[test]
    fn test_interactive_refusal_fails() {
        let prompt = ScriptedPrompt::answers(&[false]);
        let mut allowed = BTreeSet::new();
        let mut policy = OverwritePolicy::new(true, &prompt, &mut allowed);
        assert!(matches!(
            policy.check("/opt/a"),
            Err(PlacerError::OverwriteRefused { .. })
        ));
        assert!(allowed.is_empty());
    }
}
