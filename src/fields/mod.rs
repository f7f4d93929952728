//! Field normalizers
//!
//! Pure functions from raw OCR text to canonical field values. Which
//! variants run is decided once per batch by [`FieldPolicy`].

pub mod amount;
pub mod date;
pub mod invoice_no;

use crate::config::FieldPolicy;

/// Canonical values of one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues {
    pub invoice_no: Option<String>,
    pub invoice_date: Option<String>,
    pub total_amount: Option<String>,
    /// Only reported under [`FieldPolicy::Strict`]
    pub complete: Option<bool>,
}

/// Normalize the three raw texts of a page under `policy`
pub fn normalize_fields(
    policy: FieldPolicy,
    invoice_no_text: &str,
    date_text: &str,
    amount_text: &str,
) -> FieldValues {
    let (invoice_no, complete) = match policy {
        FieldPolicy::Strict => {
            let number = invoice_no::strict(invoice_no_text);
            let complete = invoice_no::is_complete(number.as_deref());
            (number, Some(complete))
        }
        FieldPolicy::Loose => (invoice_no::permissive(invoice_no_text), None),
    };

    FieldValues {
        invoice_no,
        invoice_date: date::normalize(date_text, policy),
        total_amount: amount::normalize(amount_text),
        complete,
    }
}
