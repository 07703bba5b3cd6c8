//! Storefront records as kept in the document store.
//!
//! Field names match the stored documents (camelCase). Decode snapshots
//! into these with [`Snapshot::decode`](crate::types::Snapshot::decode).

use crate::types::DocumentId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Collection holding [`Product`]s.
pub const PRODUCTS: &str = "products";

/// Collection holding [`Order`]s.
pub const ORDERS: &str = "orders";

/// Collection holding [`HeroImage`]s.
pub const HERO_IMAGES: &str = "heroImages";

/// Collection holding store-wide settings documents.
pub const SETTINGS: &str = "settings";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductImage {
    pub id: String,
    pub url: String,
    pub alt: String,
    pub hint: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub price_formatted: String,
    pub images: Vec<ProductImage>,
    pub sizes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_link: Option<String>,
}

impl Product {
    /// Build a new listing from admin form values. `sizes` is
    /// comma-separated; blank entries are dropped.
    pub fn listing(
        id: &DocumentId,
        name: &str,
        description: &str,
        price: f64,
        image_url: &str,
        sizes: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            price,
            price_formatted: format_price_inr(price),
            images: vec![ProductImage {
                id: format!("{}_img", id),
                url: image_url.to_string(),
                alt: name.to_string(),
                hint: "product photo".to_string(),
            }],
            sizes: sizes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            product_link: None,
        }
    }

    pub fn primary_image(&self) -> Option<&ProductImage> {
        self.images.first()
    }
}

/// Product as captured on the order at checkout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub name: String,
    pub price: f64,
    pub size: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub product_id: String,
    pub customer_name: String,
    pub customer_contact: String,
    pub customer_address: String,
    pub order_date: String,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_details: Option<ProductDetails>,
}

impl Order {
    /// Partial update marking an order complete.
    pub fn completion_patch(completed_date: &str) -> Value {
        json!({
            "isCompleted": true,
            "completedDate": completed_date,
        })
    }

    /// Partial update moving an order back to pending.
    pub fn reopen_patch() -> Value {
        json!({
            "isCompleted": false,
            "completedDate": Value::Null,
        })
    }
}

/// Banner image shown on the storefront.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeroImage {
    pub id: String,
    pub description: String,
    pub image_url: String,
    pub image_hint: String,
}

/// Format a rupee amount with Indian digit grouping, e.g. `₹1,23,456`.
/// At most three fraction digits are kept.
pub fn format_price_inr(price: f64) -> String {
    if !price.is_finite() {
        return format!("₹{}", price);
    }

    let sign = if price < 0.0 { "-" } else { "" };
    let thousandths = (price.abs() * 1000.0).round() as u64;
    let whole = (thousandths / 1000).to_string();
    let fraction = thousandths % 1000;

    let grouped = if whole.len() <= 3 {
        whole
    } else {
        let (head, tail) = whole.split_at(whole.len() - 3);
        let mut groups: Vec<&str> = Vec::new();
        let mut end = head.len();
        while end > 0 {
            let start = end.saturating_sub(2);
            groups.push(&head[start..end]);
            end = start;
        }
        groups.reverse();
        format!("{},{}", groups.join(","), tail)
    };

    if fraction == 0 {
        format!("₹{}{}", sign, grouped)
    } else {
        let digits = format!("{:03}", fraction);
        format!("₹{}{}.{}", sign, grouped, digits.trim_end_matches('0'))
    }
}
