use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const MAX_APP_ID_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

impl AppId {
    pub fn parse(input: &str) -> Result<Self> {
        validate_app_id(input)?;
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn lock_key(&self) -> String {
        format!("app-install:{}", self.0)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AppId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        validate_app_id(&value)?;
        Ok(Self(value))
    }
}

impl From<AppId> for String {
    fn from(value: AppId) -> Self {
        value.0
    }
}

pub fn validate_app_id(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(anyhow!("application id must not be empty"));
    }
    if input.len() > MAX_APP_ID_LEN {
        return Err(anyhow!(
            "application id '{input}' exceeds {MAX_APP_ID_LEN} characters"
        ));
    }

    let mut chars = input.chars();
    let Some(first) = chars.next() else {
        return Err(anyhow!("application id must not be empty"));
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err(anyhow!(
            "application id must start with a lowercase letter or digit: {input}"
        ));
    }
    if chars.any(|ch| {
        !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.'))
    }) {
        return Err(anyhow!(
            "application id contains invalid character(s): {input}"
        ));
    }

    Ok(())
}
