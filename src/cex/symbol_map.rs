//! Canonical/native symbol index built from an exchange's instrument
//! catalogue.
//!
//! Look-ups accept the canonical `BASE/QUOTE` form and whatever native
//! aliases the connector registered (`BTCUSDT`, `BTC-USDT`, `BTC_USDT`, …).
//! The index is built once per connector lifetime and never mutated.

use std::collections::HashMap;

pub struct SymbolIndex<T> {
    items: Vec<T>,
    by_alias: HashMap<String, usize>,
}

impl<T> SymbolIndex<T> {
    /// `aliases` pushes every key the item should be reachable under.
    /// Earlier items win on alias collisions.
    pub fn build<F>(items: Vec<T>, aliases: F) -> Self
    where
        F: Fn(&T, &mut Vec<String>),
    {
        let mut by_alias = HashMap::new();
        let mut keys = Vec::new();
        for (idx, item) in items.iter().enumerate() {
            keys.clear();
            aliases(item, &mut keys);
            for key in keys.drain(..) {
                by_alias.entry(key).or_insert(idx);
            }
        }
        Self { items, by_alias }
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.by_alias.get(key).map(|&idx| &self.items[idx])
    }

    /// First hit among several candidate keys.
    pub fn get_any<'a, I>(&self, keys: I) -> Option<&T>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter().find_map(|key| self.get(key))
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ticker;

    fn ticker(base: &str, quote: &str, native: &str) -> Ticker {
        Ticker {
            symbol: format!("{}/{}", base, quote),
            base: base.to_string(),
            quote: quote.to_string(),
            is_spot_enabled: true,
            is_margin_enabled: false,
            exchange_symbol: Some(native.to_string()),
        }
    }

    fn index() -> SymbolIndex<Ticker> {
        SymbolIndex::build(
            vec![ticker("BTC", "USDT", "BTCUSDT"), ticker("ETH", "USDT", "ETHUSDT")],
            |t, keys| {
                keys.push(t.symbol.clone());
                keys.push(t.symbol.replace('/', ""));
                if let Some(native) = &t.exchange_symbol {
                    keys.push(native.clone());
                }
            },
        )
    }

    #[test]
    fn test_lookup_by_canonical_and_native() {
        let idx = index();
        assert_eq!(idx.get("BTC/USDT").unwrap().base, "BTC");
        assert_eq!(idx.get("BTCUSDT").unwrap().base, "BTC");
        assert!(idx.get("XXX/BTC").is_none());
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_round_trip_canonical_native_canonical() {
        let idx = index();
        for symbol in ["BTC/USDT", "ETH/USDT"] {
            let native = idx.get(symbol).unwrap().exchange_symbol.clone().unwrap();
            assert_eq!(idx.get(&native).unwrap().symbol, symbol);
        }
    }

    #[test]
    fn test_get_any_takes_first_hit() {
        let idx = index();
        let hit = idx.get_any(["nope", "ETHUSDT", "BTC/USDT"]).unwrap();
        assert_eq!(hit.base, "ETH");
    }
}
