use tessera_clock::DurationSecs;

use crate::{AccessToken, AccessTokenRef};

/// A freshly issued token together with how long the authority says it is valid
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    access_token: AccessToken,
    valid_for: DurationSecs,
}

impl Credential {
    /// Constructs a credential from an issued token and its validity period
    pub fn new(access_token: impl Into<String>, valid_for: DurationSecs) -> Self {
        Self {
            access_token: AccessToken::new(access_token.into()),
            valid_for,
        }
    }

    /// Gets the issued access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets how long the token remains valid from the moment it was issued
    #[inline]
    pub fn valid_for(&self) -> DurationSecs {
        self.valid_for
    }
}

impl From<(AccessToken, DurationSecs)> for Credential {
    fn from((access_token, valid_for): (AccessToken, DurationSecs)) -> Self {
        Self {
            access_token,
            valid_for,
        }
    }
}
