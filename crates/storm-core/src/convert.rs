//! Conversion between the operator-facing application document and the
//! API model.
//!
//! User documents write service references as `component[service]`
//! strings; the API model carries them structured.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Application, ComponentLink, ServiceRef};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("malformed service reference {0:?}, expected component[service]")]
    BadServiceRef(String),
}

/// A link as written in a user document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLink {
    pub from: String,
    /// Destination in `component[service]` form.
    pub to: String,
}

/// The operator-facing application document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserApplication {
    pub name: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<UserLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<String>,
}

impl UserApplication {
    /// Convert to the wire model, parsing all `component[service]` forms.
    pub fn to_api_model(&self) -> Result<Application, ConvertError> {
        let links = self
            .links
            .iter()
            .map(|link| {
                Ok(ComponentLink {
                    from_component: link.from.clone(),
                    to_service: parse_service_ref(&link.to)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let expose = self
            .expose
            .iter()
            .map(|s| parse_service_ref(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Application {
            name: self.name.clone(),
            components: self.components.clone(),
            links,
            expose,
        })
    }

    /// Rebuild the user document from the wire model.
    pub fn to_user_model(application: &Application) -> Self {
        Self {
            name: application.name.clone(),
            components: application.components.clone(),
            links: application
                .links
                .iter()
                .map(|link| UserLink {
                    from: link.from_component.clone(),
                    to: link.to_service.to_string(),
                })
                .collect(),
            expose: application.expose.iter().map(ServiceRef::to_string).collect(),
        }
    }
}

/// Parse a `component[service]` reference.
fn parse_service_ref(text: &str) -> Result<ServiceRef, ConvertError> {
    let bad = || ConvertError::BadServiceRef(text.to_string());

    let (component, rest) = text.split_once('[').ok_or_else(bad)?;
    let service = rest.strip_suffix(']').ok_or_else(bad)?;

    if component.is_empty() || service.is_empty() || service.contains('[') {
        return Err(bad());
    }

    Ok(ServiceRef {
        component: component.to_string(),
        service: service.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_app() -> UserApplication {
        UserApplication {
            name: "a1".to_string(),
            components: vec!["frontend".to_string(), "db".to_string()],
            links: vec![UserLink {
                from: "frontend".to_string(),
                to: "db[postgres]".to_string(),
            }],
            expose: vec!["frontend[http]".to_string()],
        }
    }

    #[test]
    fn parse_valid_service_ref() {
        let parsed = parse_service_ref("frontend[http]").unwrap();
        assert_eq!(parsed.component, "frontend");
        assert_eq!(parsed.service, "http");
    }

    #[test]
    fn parse_rejects_malformed_refs() {
        for bad in ["frontend", "frontend[", "[http]", "frontend[]", "a[b[c]]"] {
            assert!(parse_service_ref(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn user_model_round_trips() {
        let user = user_app();
        let api = user.to_api_model().unwrap();
        assert_eq!(api.expose[0].component, "frontend");
        assert_eq!(api.links[0].to_service.service, "postgres");

        let back = UserApplication::to_user_model(&api);
        assert_eq!(back, user);
    }

    #[test]
    fn bad_expose_fails_conversion() {
        let mut user = user_app();
        user.expose.push("oops".to_string());
        assert!(matches!(
            user.to_api_model(),
            Err(ConvertError::BadServiceRef(_))
        ));
    }
}
