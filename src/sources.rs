use crate::db::Database;
use crate::models::{SourceModule, SourceRecord};
use std::sync::Arc;

/// Read-only access to the per-module collections written by the rest of
/// the workspace. Legacy key fallbacks live here so the query executor
/// only ever asks for a module. Fetching never fails: a missing or
/// corrupt collection degrades to an empty set with a warning.
#[derive(Debug, Clone)]
pub struct DataSources {
    db: Arc<Database>,
}

impl DataSources {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn fetch(&self, module: SourceModule) -> Vec<SourceRecord> {
        match module {
            SourceModule::Properties => self.read_array("properties"),
            SourceModule::Contacts => self.read_array("contacts"),
            SourceModule::Leads => self.first_non_empty(&["leads", "crm_leads", "leads_data"]),
            SourceModule::Deals => {
                let mut deals = self.read_union(&["sell_cycles", "purchase_cycles", "rent_cycles"]);
                if deals.is_empty() {
                    deals = self.read_array("deals");
                }
                deals
            }
            SourceModule::Financials => {
                self.read_union(&["commissions", "expenses", "agency_transactions"])
            }
            SourceModule::Portfolio => self
                .read_array("properties")
                .into_iter()
                .filter(|record| {
                    record
                        .get("inPortfolio")
                        .and_then(|flag| flag.as_bool())
                        .unwrap_or(false)
                })
                .collect(),
            SourceModule::Requirements => {
                let mut requirements =
                    self.read_union(&["buyer_requirements", "rent_requirements"]);
                if requirements.is_empty() {
                    requirements = self.read_array("requirements");
                }
                requirements
            }
        }
    }

    fn read_array(&self, key: &str) -> Vec<SourceRecord> {
        match self.db.read_raw(key) {
            Ok(Some(serde_json::Value::Array(records))) => records,
            Ok(Some(_)) => {
                tracing::warn!(key, "source collection is not an array, treating as empty");
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::warn!(key, error = %error, "source collection unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    fn first_non_empty(&self, keys: &[&str]) -> Vec<SourceRecord> {
        for key in keys {
            let records = self.read_array(key);
            if !records.is_empty() {
                return records;
            }
        }
        Vec::new()
    }

    fn read_union(&self, keys: &[&str]) -> Vec<SourceRecord> {
        keys.iter().flat_map(|key| self.read_array(key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (tempfile::TempDir, DataSources) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        (dir, DataSources::new(db))
    }

    #[test]
    fn leads_fall_back_through_legacy_keys() {
        let (_dir, sources) = fixture();
        sources
            .db
            .write_raw("crm_leads", &json!([{"id": "l-1"}]))
            .expect("seed");
        let leads = sources.fetch(SourceModule::Leads);
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0]["id"], "l-1");
    }

    #[test]
    fn deals_union_cycle_collections() {
        let (_dir, sources) = fixture();
        sources
            .db
            .write_raw("sell_cycles", &json!([{"id": "s-1"}]))
            .expect("seed");
        sources
            .db
            .write_raw("rent_cycles", &json!([{"id": "r-1"}]))
            .expect("seed");
        // Legacy key is ignored once cycle collections exist.
        sources
            .db
            .write_raw("deals", &json!([{"id": "legacy"}]))
            .expect("seed");
        let deals = sources.fetch(SourceModule::Deals);
        assert_eq!(deals.len(), 2);
    }

    #[test]
    fn corrupt_collection_degrades_to_empty() {
        let (_dir, sources) = fixture();
        sources
            .db
            .write_raw("contacts", &json!("not an array"))
            .expect("seed");
        assert!(sources.fetch(SourceModule::Contacts).is_empty());
    }

    #[test]
    fn portfolio_is_the_flagged_subset_of_properties() {
        let (_dir, sources) = fixture();
        sources
            .db
            .write_raw(
                "properties",
                &json!([
                    {"id": "p-1", "inPortfolio": true},
                    {"id": "p-2", "inPortfolio": false},
                    {"id": "p-3"}
                ]),
            )
            .expect("seed");
        let portfolio = sources.fetch(SourceModule::Portfolio);
        assert_eq!(portfolio.len(), 1);
        assert_eq!(portfolio[0]["id"], "p-1");
    }
}
