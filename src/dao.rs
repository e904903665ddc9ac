//! Redis-backed item DAO
//!
//! Items are stored as members of a set per scraper, so duplicates
//! deduplicate naturally and the HTTP endpoint's count matches the set
//! cardinality.

use redis::AsyncCommands;
use serde_json::{Map, Value};

use crate::error::Result;

const KEY_PREFIX: &str = "gotana-";

/// Thin async wrapper over a Redis connection for item persistence
#[derive(Clone)]
pub struct RedisDao {
    client: redis::Client,
}

impl RedisDao {
    /// Build a DAO for `address` (host:port). The connection itself is
    /// established lazily on first use.
    pub fn new(address: &str) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{}", address))?;
        Ok(Self { client })
    }

    fn key_for(&self, scraper_name: &str) -> String {
        format!("{}{}", KEY_PREFIX, scraper_name)
    }

    /// Add one serialized record to the scraper's set
    pub async fn write(&self, scraper_name: &str, data: Vec<u8>) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.sadd(self.key_for(scraper_name), data).await?;
        Ok(())
    }

    /// Enumerate the scraper's stored records, JSON-decoded into generic
    /// maps. Members that fail to decode are skipped.
    pub async fn get_items(&self, scraper_name: &str) -> Result<Vec<Map<String, Value>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let members: Vec<String> = conn.smembers(self.key_for(scraper_name)).await?;
        Ok(decode_members(&members))
    }

    /// Cardinality of the scraper's item set
    pub async fn count_items(&self, scraper_name: &str) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.scard(self.key_for(scraper_name)).await?;
        Ok(count)
    }
}

impl std::fmt::Debug for RedisDao {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDao").finish_non_exhaustive()
    }
}

/// Decode stored set members into generic JSON maps, skipping anything that
/// is not a JSON object
fn decode_members(members: &[String]) -> Vec<Map<String, Value>> {
    members
        .iter()
        .filter_map(|member| serde_json::from_str::<Map<String, Value>>(member).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed() {
        let dao = RedisDao::new("127.0.0.1:6379").unwrap();
        assert_eq!(dao.key_for("weekly"), "gotana-weekly");
    }

    #[test]
    fn test_invalid_address_fails() {
        assert!(RedisDao::new("not an address").is_err());
    }

    #[test]
    fn test_written_records_decode_back_to_the_same_pairs() {
        let record = serde_json::json!({ "url": "https://a.example/1", "title": "one" });
        let member = serde_json::to_string(&record).unwrap();

        let decoded = decode_members(&[member]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0]["url"], "https://a.example/1");
        assert_eq!(decoded[0]["title"], "one");
    }

    #[test]
    fn test_non_object_members_are_skipped() {
        let members = vec![
            r#"{"k":"v"}"#.to_string(),
            "not json".to_string(),
            "[1,2,3]".to_string(),
        ];
        assert_eq!(decode_members(&members).len(), 1);
    }
}
