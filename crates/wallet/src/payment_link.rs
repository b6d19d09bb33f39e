//! BIP21 payment URIs: `scheme:address?amount=…` with a case-insensitive
//! scheme match and an exact-decimal amount.

use bitcoin::{Amount, Denomination};

use crate::{error::Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentUri {
    pub address: String,
    pub amount: Option<Amount>,
}

impl PaymentUri {
    /// Parses a BIP21 URI. The scheme must match `expected_scheme`
    /// case-insensitively and the address part must be non-empty; anything
    /// else is [`Error::InvalidUri`].
    pub fn parse(uri: &str, expected_scheme: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| Error::InvalidUri(uri.to_string()))?;
        if !scheme.eq_ignore_ascii_case(expected_scheme) {
            return Err(Error::InvalidUri(uri.to_string()));
        }

        let (address, query) = match rest.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (rest, None),
        };
        if address.is_empty() {
            return Err(Error::InvalidUri(uri.to_string()));
        }

        let mut amount = None;
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(("amount", value)) = pair.split_once('=') {
                    amount = Some(Amount::from_str_in(value, Denomination::Bitcoin)?);
                }
            }
        }

        Ok(PaymentUri {
            address: address.to_string(),
            amount,
        })
    }

    /// Renders the URI form, used by receive screens and QR codes.
    pub fn render(&self, scheme: &str) -> String {
        match self.amount {
            Some(amount) => format!(
                "{}:{}?amount={:.8}",
                scheme,
                self.address,
                amount.display_in(Denomination::Bitcoin)
            ),
            None => format!("{}:{}", scheme, self.address),
        }
    }
}
