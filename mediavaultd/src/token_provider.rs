use crate::backend::CredentialProvider;

/// Hands out a token obtained elsewhere. Refresh happens outside this
/// process; an empty token counts as signed out.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }
}

impl CredentialProvider for StaticTokenProvider {
    fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    fn current_credentials(&self) -> Option<String> {
        self.token.clone()
    }
}
