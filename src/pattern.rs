use crate::error::AppError;
use crate::model::{Address, AssetName, Credential, Output, OutputReference, PolicyId, TransactionId};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A declarative matcher selecting which outputs get indexed. The variant set
/// is closed: matching, inclusion, overlap and the SQL translation are all
/// total matches over it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Pattern {
    Any,
    ExactAddress(Address),
    PaymentCredential(Credential),
    DelegationCredential(Credential),
    AddressPair { payment: Credential, delegation: Credential },
    Policy(PolicyId),
    Asset { policy_id: PolicyId, asset_name: AssetName },
    Transaction(TransactionId),
    Reference(OutputReference),
}

impl Pattern {
    pub fn matches(&self, reference: &OutputReference, output: &Output) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::ExactAddress(address) => output.address.text() == address.text(),
            Pattern::PaymentCredential(credential) => output.address.payment_credential() == Some(credential),
            Pattern::DelegationCredential(credential) => output.address.delegation_credential() == Some(credential),
            Pattern::AddressPair { payment, delegation } => {
                output.address.payment_credential() == Some(payment)
                    && output.address.delegation_credential() == Some(delegation)
            }
            Pattern::Policy(policy_id) => output.value.has_policy(policy_id),
            Pattern::Asset { policy_id, asset_name } => output.value.has_asset(policy_id, asset_name),
            Pattern::Transaction(transaction_id) => &reference.transaction_id == transaction_id,
            Pattern::Reference(target) => reference == target,
        }
    }

    /// `self` includes `other` when every output matched by `other` is
    /// necessarily matched by `self`.
    pub fn includes(&self, other: &Pattern) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (Pattern::Any, _) => true,
            (Pattern::PaymentCredential(c), Pattern::ExactAddress(a)) => a.payment_credential() == Some(c),
            (Pattern::PaymentCredential(c), Pattern::AddressPair { payment, .. }) => c == payment,
            (Pattern::DelegationCredential(c), Pattern::ExactAddress(a)) => a.delegation_credential() == Some(c),
            (Pattern::DelegationCredential(c), Pattern::AddressPair { delegation, .. }) => c == delegation,
            (Pattern::AddressPair { payment, delegation }, Pattern::ExactAddress(a)) => {
                a.payment_credential() == Some(payment) && a.delegation_credential() == Some(delegation)
            }
            (Pattern::Policy(p), Pattern::Asset { policy_id, .. }) => p == policy_id,
            (Pattern::Transaction(t), Pattern::Reference(r)) => &r.transaction_id == t,
            _ => false,
        }
    }

    /// Two patterns overlap when some output could be matched by both.
    /// Patterns constraining different dimensions (an address vs. a policy)
    /// always overlap; within one dimension, distinct values are disjoint.
    pub fn overlaps(&self, other: &Pattern) -> bool {
        use Pattern::*;
        match (self, other) {
            (Any, _) | (_, Any) => true,

            (ExactAddress(a), ExactAddress(b)) => a.text() == b.text(),
            (ExactAddress(a), PaymentCredential(c)) | (PaymentCredential(c), ExactAddress(a)) => {
                a.payment_credential() == Some(c)
            }
            (ExactAddress(a), DelegationCredential(c)) | (DelegationCredential(c), ExactAddress(a)) => {
                a.delegation_credential() == Some(c)
            }
            (ExactAddress(a), AddressPair { payment, delegation })
            | (AddressPair { payment, delegation }, ExactAddress(a)) => {
                a.payment_credential() == Some(payment) && a.delegation_credential() == Some(delegation)
            }
            (PaymentCredential(c), PaymentCredential(d)) => c == d,
            (PaymentCredential(c), AddressPair { payment, .. }) | (AddressPair { payment, .. }, PaymentCredential(c)) => {
                c == payment
            }
            (PaymentCredential(_), DelegationCredential(_)) | (DelegationCredential(_), PaymentCredential(_)) => true,
            (DelegationCredential(c), DelegationCredential(d)) => c == d,
            (DelegationCredential(c), AddressPair { delegation, .. })
            | (AddressPair { delegation, .. }, DelegationCredential(c)) => c == delegation,
            (
                AddressPair { payment: p1, delegation: d1 },
                AddressPair { payment: p2, delegation: d2 },
            ) => p1 == p2 && d1 == d2,

            (Policy(p), Policy(q)) => p == q,
            (Policy(p), Asset { policy_id, .. }) | (Asset { policy_id, .. }, Policy(p)) => p == policy_id,
            (Asset { policy_id: p1, asset_name: n1 }, Asset { policy_id: p2, asset_name: n2 }) => {
                p1 == p2 && n1 == n2
            }

            (Transaction(t), Transaction(u)) => t == u,
            (Transaction(t), Reference(r)) | (Reference(r), Transaction(t)) => &r.transaction_id == t,
            (Reference(r), Reference(s)) => r == s,

            // Distinct dimensions constrain independent parts of an output.
            _ => true,
        }
    }

    pub fn overlaps_any<'a, I: IntoIterator<Item = &'a Pattern>>(&self, others: I) -> bool {
        others.into_iter().any(|other| self.overlaps(other))
    }
}

fn parse_credential(s: &str) -> Option<Credential> {
    if s.len() == 56 {
        if let Ok(credential) = s.parse::<Credential>() {
            return Some(credential);
        }
    }
    if let Ok((_hrp, payload)) = bech32::decode(s) {
        if payload.len() == 28 {
            return Credential::from_slice(&payload);
        }
        // reward account given in place of a bare delegation credential
        if payload.len() == 29 && matches!(payload[0] >> 4, 14 | 15) {
            return Credential::from_slice(&payload[1..29]);
        }
    }
    None
}

impl FromStr for Pattern {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" || s == "*/*" {
            return Ok(Pattern::Any);
        }

        if let Some((index, transaction)) = s.split_once('@') {
            let transaction_id: TransactionId = transaction.parse().map_err(|_| AppError::InvalidPattern)?;
            return if index == "*" {
                Ok(Pattern::Transaction(transaction_id))
            } else {
                let output_index: u16 = index.parse().map_err(|_| AppError::InvalidPattern)?;
                Ok(Pattern::Reference(OutputReference { transaction_id, output_index }))
            };
        }

        if let Some((payment, delegation)) = s.split_once('/') {
            return match (payment, delegation) {
                ("*", delegation) => {
                    let credential = parse_credential(delegation).ok_or(AppError::InvalidPattern)?;
                    Ok(Pattern::DelegationCredential(credential))
                }
                (payment, "*") => {
                    let credential = parse_credential(payment).ok_or(AppError::InvalidPattern)?;
                    Ok(Pattern::PaymentCredential(credential))
                }
                (payment, delegation) => {
                    let payment = parse_credential(payment).ok_or(AppError::InvalidPattern)?;
                    let delegation = parse_credential(delegation).ok_or(AppError::InvalidPattern)?;
                    Ok(Pattern::AddressPair { payment, delegation })
                }
            };
        }

        if let Some((policy, asset)) = s.split_once('.') {
            let policy_id: PolicyId = policy.parse().map_err(|_| AppError::InvalidPattern)?;
            return if asset == "*" {
                Ok(Pattern::Policy(policy_id))
            } else {
                let asset_name = hex::decode(asset).map_err(|_| AppError::InvalidPattern)?;
                if asset_name.len() > 32 {
                    return Err(AppError::InvalidPattern);
                }
                Ok(Pattern::Asset { policy_id, asset_name: AssetName(asset_name) })
            };
        }

        if let Some(address) = Address::from_text(s) {
            // A reward account alone selects by its delegation part.
            let delegation_only =
                address.payment_credential().is_none().then(|| address.delegation_credential().copied()).flatten();
            return match delegation_only {
                Some(delegation) => Ok(Pattern::DelegationCredential(delegation)),
                None => Ok(Pattern::ExactAddress(address)),
            };
        }

        Err(AppError::InvalidPattern)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => write!(f, "*"),
            Pattern::ExactAddress(address) => write!(f, "{}", address.text()),
            Pattern::PaymentCredential(credential) => write!(f, "{}/*", credential),
            Pattern::DelegationCredential(credential) => write!(f, "*/{}", credential),
            Pattern::AddressPair { payment, delegation } => write!(f, "{}/{}", payment, delegation),
            Pattern::Policy(policy_id) => write!(f, "{}.*", policy_id),
            Pattern::Asset { policy_id, asset_name } => write!(f, "{}.{}", policy_id, asset_name),
            Pattern::Transaction(transaction_id) => write!(f, "*@{}", transaction_id),
            Pattern::Reference(reference) => write!(f, "{}", reference),
        }
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| D::Error::custom(format!("invalid pattern: {}", s)))
    }
}
