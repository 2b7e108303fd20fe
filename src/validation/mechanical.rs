//! Mechanical validation: stop-word matching and the
//! price-threshold heuristic. Both algorithms are ported byte-for-byte from
//! the reference implementation; the stop-word list itself stays out of
//! scope and is supplied by the caller.

use crate::store::models::CatalogListing;

#[derive(Debug, Clone, PartialEq)]
pub struct MechanicalResult {
    pub avito_item_id: i64,
    pub passed: bool,
    pub rejection_reason: Option<&'static str>,
}

/// Any stop-word containing `-`, `/`, or `.` matches as a case-folded
/// substring; every other stop-word matches as a whole word, approximated
/// by padding both sides with spaces before searching.
pub fn check_stopwords(text: &str, stopwords: &[String]) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let text_lower = text.to_lowercase();
    let padded = format!(" {text_lower} ");

    stopwords
        .iter()
        .filter(|word| {
            let word_lower = word.to_lowercase();
            if word_lower.contains(['-', '/', '.']) {
                text_lower.contains(&word_lower)
            } else {
                padded.contains(&format!(" {word_lower} "))
            }
        })
        .cloned()
        .collect()
}

/// `None` when there are no usable (positive) prices to derive a threshold
/// from — the caller skips the price check in that case.
pub fn calculate_price_threshold(prices: &[i64]) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }

    let mut sorted_desc = prices.to_vec();
    sorted_desc.sort_unstable_by(|a, b| b.cmp(a));

    let top20_count = std::cmp::max(1, (sorted_desc.len() as f64 * 0.2) as usize);
    let top20 = &sorted_desc[..top20_count];

    let mut sorted_top20 = top20.to_vec();
    sorted_top20.sort_unstable();
    let median_index = sorted_top20.len() / 2;
    let median = sorted_top20[median_index];

    let filtered: Vec<i64> = top20
        .iter()
        .copied()
        .filter(|&p| p <= median * 3)
        .collect();
    let filtered = if filtered.is_empty() { vec![median] } else { filtered };

    let avg_top20 = filtered.iter().sum::<i64>() as f64 / filtered.len() as f64;
    Some(avg_top20 * 0.5)
}

/// Validates every listing in one catalog batch, returning a result per
/// listing. `stopwords` is the caller-supplied list; loading it from disk
/// or a remote config is the caller's job, not this function's.
pub fn validate_mechanical(
    listings: &[CatalogListing],
    stopwords: &[String],
) -> Vec<MechanicalResult> {
    let prices: Vec<i64> = listings.iter().map(|l| l.price).filter(|&p| p > 0).collect();
    let threshold = calculate_price_threshold(&prices);

    listings
        .iter()
        .map(|listing| {
            let mut hits = check_stopwords(&listing.title, stopwords);
            hits.extend(check_stopwords(&listing.description, stopwords));
            hits.extend(check_stopwords(&listing.seller, stopwords));

            let price_valid = match threshold {
                Some(t) if listing.price > 0 => listing.price as f64 >= t,
                _ => true,
            };

            let (passed, rejection_reason) = if !hits.is_empty() {
                (false, Some("stopwords"))
            } else if !price_valid {
                (false, Some("price"))
            } else {
                (true, None)
            };

            MechanicalResult {
                avito_item_id: listing.avito_item_id,
                passed,
                rejection_reason,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: i64, title: &str, price: i64) -> CatalogListing {
        CatalogListing {
            avito_item_id: id,
            title: title.to_string(),
            description: String::new(),
            price,
            seller: "seller".to_string(),
        }
    }

    #[test]
    fn substring_stopword_matches_anywhere() {
        let stopwords = vec!["б/у".to_string()];
        let hits = check_stopwords("продам б/у диван", &stopwords);
        assert_eq!(hits, vec!["б/у".to_string()]);
    }

    #[test]
    fn whole_word_stopword_requires_boundaries() {
        let stopwords = vec!["ремонт".to_string()];
        assert!(check_stopwords("требуется ремонт", &stopwords).contains(&"ремонт".to_string()));
        assert!(check_stopwords("отремонтированный", &stopwords).is_empty());
    }

    #[test]
    fn price_threshold_matches_reference_formula() {
        // count=10 -> top20_count=2 -> top20=[100,90]; sorted ascending [90,100],
        // median_index=2/2=1 -> median=100; filtered=[100,90] (both <=300);
        // avg=95.0 -> threshold=47.5
        let prices = vec![100, 90, 80, 70, 60, 50, 40, 30, 20, 10];
        let threshold = calculate_price_threshold(&prices).unwrap();
        assert!((threshold - 47.5).abs() < f64::EPSILON);
    }

    #[test]
    fn price_threshold_drops_outliers_then_falls_back_to_median() {
        let prices = vec![1000, 10];
        // top20_count = max(1, int(2*0.2)) = max(1, 0) = 1 -> top20 = [1000]
        // median = 1000, filtered = [1000] (1000 <= 3000), avg=1000, threshold=500
        let threshold = calculate_price_threshold(&prices).unwrap();
        assert!((threshold - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_prices_skips_the_check() {
        assert_eq!(calculate_price_threshold(&[]), None);
    }

    #[test]
    fn validate_mechanical_rejects_below_threshold() {
        let listings = vec![
            listing(1, "widget", 1000),
            listing(2, "widget", 10),
        ];
        let results = validate_mechanical(&listings, &[]);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(results[1].rejection_reason, Some("price"));
    }

    proptest::proptest! {
        #[test]
        fn price_threshold_never_panics_and_stays_below_the_max(
            prices in proptest::collection::vec(1i64..1_000_000, 1..200)
        ) {
            let max = *prices.iter().max().unwrap();
            if let Some(threshold) = calculate_price_threshold(&prices) {
                proptest::prop_assert!(threshold <= max as f64);
                proptest::prop_assert!(threshold >= 0.0);
            }
        }
    }
}
