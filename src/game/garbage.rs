//! Attack Distribution
//!
//! Routes cleared-line attacks to opponents. An attack is split evenly over
//! the target set; each recipient keeps a fractional carry so repeated small
//! attacks eventually produce whole lines without losing or duplicating any
//! fraction.
//!
//! Carries are Q16.16 fixed-point (see [`crate::core::fixed`]), so for a fixed
//! target set the lines delivered plus the remaining carry always equal the
//! lines requested, exactly.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::core::fixed::{self, Fixed, FIXED_ONE};
use crate::game::state::ParticipantId;

/// Distribution tuning.
#[derive(Debug, Clone)]
pub struct GarbageConfig {
    /// Attacks of at least this size deliver one line to every target even
    /// when the even split is below one (lobbies only).
    pub pity_threshold: u32,
    /// Largest single delivery; the rest stays in the carry for the flush.
    pub max_delivery: u32,
    /// Largest attack accepted from a client; bigger claims are clamped.
    pub max_attack: u32,
}

impl Default for GarbageConfig {
    fn default() -> Self {
        Self {
            pity_threshold: 4,
            max_delivery: 10,
            max_attack: 30,
        }
    }
}

/// How the sender wants an attack routed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttackMode {
    /// Split over every eligible opponent.
    #[default]
    Even,
    /// Everything to one chosen opponent.
    Direct {
        /// Chosen opponent.
        target: ParticipantId,
    },
    /// Everything to the opponent closest to topping out.
    Finisher,
    /// Everything to whoever attacked the sender most recently.
    Revenge,
}

/// Whole lines leaving the ledger for one recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Receiving participant.
    pub recipient: ParticipantId,
    /// Whole lines.
    pub amount: u32,
}

/// Per-recipient fractional carries.
#[derive(Debug)]
pub struct GarbageLedger {
    config: GarbageConfig,
    carry: BTreeMap<ParticipantId, Fixed>,
}

impl GarbageLedger {
    /// Create an empty ledger.
    pub fn new(config: GarbageConfig) -> Self {
        Self {
            config,
            carry: BTreeMap::new(),
        }
    }

    /// Ledger configuration.
    pub fn config(&self) -> &GarbageConfig {
        &self.config
    }

    /// Split `amount` lines over `targets` and emit whatever became whole.
    ///
    /// With `pity` set, an attack of at least `pity_threshold` lines whose
    /// even share is below one line credits exactly one line per target.
    /// `amount` is clamped to `max_attack` first.
    pub fn distribute(&mut self, amount: u32, targets: &[ParticipantId], pity: bool) -> Vec<Delivery> {
        let amount = amount.min(self.config.max_attack);
        if amount == 0 || targets.is_empty() {
            return Vec::new();
        }

        let mut shares = fixed::split_even(amount, targets.len());
        if pity && amount >= self.config.pity_threshold {
            for share in shares.iter_mut() {
                if *share < FIXED_ONE {
                    *share = FIXED_ONE;
                }
            }
        }

        let mut deliveries = Vec::new();
        for (target, share) in targets.iter().zip(shares) {
            let acc = self.carry.entry(*target).or_insert(0);
            *acc = acc.saturating_add(share);
            if let Some(delivery) = Self::extract(*target, acc, self.config.max_delivery) {
                deliveries.push(delivery);
            }
        }
        deliveries
    }

    /// Re-check every carry for deliverable whole lines.
    ///
    /// Picks up what the per-delivery cap held back.
    pub fn flush(&mut self) -> Vec<Delivery> {
        let max = self.config.max_delivery;
        self.carry
            .iter_mut()
            .filter_map(|(id, acc)| Self::extract(*id, acc, max))
            .collect()
    }

    /// Drop a recipient's carry (they left their session).
    pub fn discard(&mut self, id: &ParticipantId) -> Fixed {
        self.carry.remove(id).unwrap_or(0)
    }

    /// Current carry for a recipient.
    pub fn carry(&self, id: &ParticipantId) -> Fixed {
        self.carry.get(id).copied().unwrap_or(0)
    }

    /// Number of recipients with a carry entry.
    pub fn tracked(&self) -> usize {
        self.carry.len()
    }

    fn extract(recipient: ParticipantId, acc: &mut Fixed, max: u32) -> Option<Delivery> {
        let whole = fixed::whole_lines(*acc).min(max);
        if whole == 0 {
            return None;
        }
        *acc -= fixed::from_lines(whole);
        Some(Delivery { recipient, amount: whole })
    }
}
