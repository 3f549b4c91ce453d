use super::Reply;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use url::form_urlencoded;

// Error Handling
use vmplane_error::{Reason, VmplaneError};

/**
Query parameters narrowing a collection list, as in `/vms?name=^web`.

Each parameter is a regex searched in the text of the entity field of the
same name. An entity is kept when every parameter matches.
*/
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    fields: Vec<(String, Regex)>,
}

impl ListFilter {
    pub fn new<K, V, I>(params: I) -> Result<Self, VmplaneError>
    where
        K: Into<String>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut fields = vec![];
        for (field, pattern) in params {
            let field: String = field.into();
            let re = Regex::new(pattern.as_ref()).map_err(|e| {
                VmplaneError::invalid(
                    Reason::FilterInvalid,
                    &format!("bad {} pattern {:#?}: {}", field, pattern.as_ref(), e),
                )
            })?;
            fields.push((field, re));
        }
        Ok(Self { fields })
    }
    /// Parse a query string like "name=test-vm1&state=running".
    pub fn parse(query: &str) -> Result<Self, VmplaneError> {
        let query = query.trim_start_matches('?');
        Self::new(form_urlencoded::parse(query.as_bytes()))
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
    /*
     * Strings are matched as is, numbers and booleans through their json
     * text. A missing or null field never matches.
     */
    pub fn matches<T: Serialize>(&self, entity: &T) -> bool {
        if self.is_empty() {
            return true;
        }
        let Ok(Value::Object(map)) = serde_json::to_value(entity) else {
            return false;
        };
        self.fields.iter().all(|(field, re)| match map.get(field) {
            Some(Value::String(e)) => re.is_match(e),
            Some(Value::Null) | None => false,
            Some(value) => re.is_match(&value.to_string()),
        })
    }
    pub fn apply<T: Serialize>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().filter(|e| self.matches(e)).collect()
    }
}

impl<T: Serialize> Reply<Vec<T>> {
    /// Keep the listed entities the filter matches.
    pub fn filtered(self, filter: &ListFilter) -> Self {
        match self {
            Reply::Ok(items) => Reply::Ok(filter.apply(items)),
            other => other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::fixture::Fixture;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    // Error Handling
    use miette::Result;

    fn names(reply: Reply<Vec<Value>>) -> Vec<String> {
        reply
            .into_inner()
            .unwrap_or_default()
            .iter()
            .filter_map(|e| e["name"].as_str().map(str::to_owned))
            .collect()
    }

    #[test]
    fn query_strings() -> Result<()> {
        let filter = ListFilter::parse("?name=test-vm1&state=running")?;
        assert!(filter.matches(&json!({ "name": "test-vm1", "state": "running" })));
        assert!(!filter.matches(&json!({ "name": "test-vm1", "state": "shutoff" })));
        assert!(!filter.matches(&json!({ "name": "test-vm1" })));

        let filter = ListFilter::parse("cpus=%5E2%24")?;
        assert!(filter.matches(&json!({ "cpus": 2 })));
        assert!(!filter.matches(&json!({ "cpus": 12 })));

        assert!(ListFilter::parse("")?.is_empty());
        let err = ListFilter::parse("name=(").unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.reason(), Some(Reason::FilterInvalid));
        Ok(())
    }

    #[test]
    fn filtered_replies() -> Result<()> {
        let reply = Reply::Ok(vec![
            json!({ "name": "test" }),
            json!({ "name": "test-vm1" }),
            json!({ "name": "test-vm2" }),
        ]);
        let filter = ListFilter::new([("name", "vm")])?;
        assert_eq!(names(reply.filtered(&filter)), vec!["test-vm1", "test-vm2"]);
        assert_eq!(Reply::<Vec<Value>>::NoContent.filtered(&filter), Reply::NoContent);
        Ok(())
    }

    #[tokio::test]
    async fn vm_list_by_name() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.template("test").await?;
        fx.vm("test", "test-vm1").await?;
        fx.vm("test", "test-vm2").await?;
        fx.orchestrator.vm_start("test-vm2").await?;

        let filter = ListFilter::parse("name=test-vm1")?;
        let res = fx.orchestrator.vm_list().await?.filtered(&filter);
        let res: Vec<String> = res.into_inner().unwrap_or_default().into_iter().map(|e| e.name).collect();
        assert_eq!(res, vec!["test-vm1"]);

        let filter = ListFilter::parse("state=running")?;
        let res = fx.orchestrator.vm_list().await?.filtered(&filter);
        let res: Vec<String> = res.into_inner().unwrap_or_default().into_iter().map(|e| e.name).collect();
        assert_eq!(res, vec!["test-vm2"]);

        let filter = ListFilter::parse("name=^default")?;
        let res = fx.orchestrator.pool_list().await?.filtered(&filter);
        assert_eq!(res.into_inner().map(|e| e.len()), Some(1));
        Ok(())
    }
}
