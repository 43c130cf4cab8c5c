// src/reconcile.rs
//
// Distribution of an invoice's target net/gross weights over its items.
// The service proposal is advisory; `correct` alone owns the invariants:
// exact sums and gross >= net >= 0 per item.

use crate::error::{IntrastatError, Result};
use crate::inference::{InferenceService, ProposalItem, WeightProposalRequest, extract_json_span};
use crate::locale::parse_decimal;
use crate::model::{LineItem, Targets, Weight};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Per-item (net, gross) pair.
pub type WeightPair = (Weight, Weight);

/// Which stage-one input fed the correction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSource {
    Proposal,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reconciled {
        source: ReconcileSource,
        participants: usize,
    },
    /// No product rows to carry the targets; items are left as they were.
    NothingToReconcile,
}

/// Fill in final weights for every item of one invoice.
///
/// Product rows share the targets exactly. Non-product rows get zero weights.
/// Placeholder rows keep no final weight.
pub async fn reconcile(
    items: &mut [LineItem],
    targets: Targets,
    service: &dyn InferenceService,
) -> ReconcileOutcome {
    let participants: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.is_weighable())
        .map(|(idx, _)| idx)
        .collect();

    if participants.is_empty() {
        warn!(net = %targets.net(), gross = %targets.gross(), "No product rows to carry the target weights");
        return ReconcileOutcome::NothingToReconcile;
    }

    for item in items.iter_mut().filter(|i| !i.is_product && !i.is_placeholder()) {
        item.final_net_weight = Some(Weight::ZERO);
        item.final_gross_weight = Some(Weight::ZERO);
    }

    let request = WeightProposalRequest {
        items: participants
            .iter()
            .map(|&idx| {
                let item = &items[idx];
                ProposalItem {
                    item_code: item.item_code.clone(),
                    description: item.description.clone(),
                    quantity: item.quantity,
                    preliminary_net_weight: item.preliminary_net_weight.known().map(Weight::as_kg),
                }
            })
            .collect(),
        target_net_weight: targets.net().as_kg(),
        target_gross_weight: targets.gross().as_kg(),
    };
    let codes: Vec<&str> = participants.iter().map(|&idx| items[idx].item_code.as_str()).collect();

    let proposed = match service.propose_weights(&request).await {
        Ok(reply) => parse_proposal(&reply, &codes, proposal_limit(targets)),
        Err(e) => Err(IntrastatError::Reconciliation(format!("proposal unavailable: {e}"))),
    };

    let (source, proposed) = match proposed {
        Ok(pairs) => (ReconcileSource::Proposal, pairs),
        Err(e) => {
            warn!(error = %e, "Falling back to proportional distribution");
            let basis: Vec<SplitBasis> = participants
                .iter()
                .map(|&idx| SplitBasis {
                    preliminary: items[idx].preliminary_net_weight.known(),
                    quantity: items[idx].quantity,
                })
                .collect();
            (ReconcileSource::Fallback, proportional_split(&basis, targets))
        }
    };

    let corrected = correct(&proposed, targets);
    for (&idx, &(net, gross)) in participants.iter().zip(&corrected) {
        items[idx].final_net_weight = Some(net);
        items[idx].final_gross_weight = Some(gross);
    }

    info!(
        source = ?source,
        participants = participants.len(),
        net = %targets.net(),
        gross = %targets.gross(),
        "Weights reconciled"
    );
    ReconcileOutcome::Reconciled {
        source,
        participants: participants.len(),
    }
}

/// Largest weight a single proposed value may carry: a thousand times the
/// gross target, but never less than one tonne.
pub fn proposal_limit(targets: Targets) -> Weight {
    Weight::from_grams(targets.gross().grams().saturating_mul(1000).max(1_000_000))
}

/// Read a proposal reply: one `{item_code, final_net_weight,
/// final_gross_weight}` per requested item, in request order. Any value
/// whose magnitude exceeds `limit` makes the whole reply unusable.
pub fn parse_proposal(reply: &str, codes: &[&str], limit: Weight) -> Result<Vec<WeightPair>> {
    let unusable = |message: String| IntrastatError::Reconciliation(message);

    let json = extract_json_span(reply, '[', ']').map_err(|e| unusable(e.to_string()))?;
    let rows: Vec<Value> = serde_json::from_str(json).map_err(|e| unusable(format!("invalid JSON: {e}")))?;
    if rows.len() != codes.len() {
        return Err(unusable(format!("{} proposals for {} items", rows.len(), codes.len())));
    }

    rows.iter()
        .zip(codes)
        .enumerate()
        .map(|(idx, (row, expected))| {
            match row.get("item_code").and_then(Value::as_str) {
                Some(code) if code.trim() != expected.trim() => {
                    return Err(unusable(format!("row {} is '{code}', expected '{expected}'", idx + 1)));
                }
                _ => {}
            }
            let net = weight_value(row.get("final_net_weight"), limit)
                .ok_or_else(|| unusable(format!("row {} has no usable net weight", idx + 1)))?;
            let gross = weight_value(row.get("final_gross_weight"), limit)
                .ok_or_else(|| unusable(format!("row {} has no usable gross weight", idx + 1)))?;
            Ok((net, gross))
        })
        .collect()
}

fn weight_value(value: Option<&Value>, limit: Weight) -> Option<Weight> {
    let kg = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => parse_decimal(s)?,
        _ => return None,
    };
    if !kg.is_finite() || kg.abs() > limit.as_kg() {
        return None;
    }
    Weight::from_kg(kg)
}

/// What the fallback knows about one participating row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitBasis {
    pub preliminary: Option<Weight>,
    pub quantity: Option<f64>,
}

/// Proposal stand-in built from preliminary weights and quantities.
///
/// Net is split in proportion to the preliminary weights. A row without one
/// but with a positive quantity is weighed at the mean known weight per
/// piece; without a quantity it gets no net share. Packaging (gross minus
/// net) is split by preliminary weight too, except that rows lacking one
/// count as an average row, so they still carry packaging.
pub fn proportional_split(basis: &[SplitBasis], targets: Targets) -> Vec<WeightPair> {
    let known: Vec<(i64, f64)> = basis
        .iter()
        .filter_map(|b| {
            let grams = b.preliminary?.grams().max(0);
            let pieces = b.quantity.filter(|q| q.is_finite() && *q > 0.0).unwrap_or(0.0);
            Some((grams, pieces))
        })
        .collect();
    let known_grams: i128 = known.iter().map(|&(g, _)| i128::from(g)).sum();
    let known_pieces: f64 = known.iter().map(|&(_, q)| q).sum();

    let average = if known.is_empty() {
        0
    } else {
        (known_grams / known.len() as i128) as i64
    };
    // with no weighed pieces to learn from, rows split by quantity alone
    let per_piece = if known_pieces > 0.0 {
        known_grams as f64 / known_pieces
    } else {
        1.0
    };

    let net_basis: Vec<i64> = basis
        .iter()
        .map(|b| match (b.preliminary, b.quantity) {
            (Some(w), _) => w.grams().max(0),
            (None, Some(q)) if q > 0.0 => (q * per_piece).round() as i64,
            (None, _) => 0,
        })
        .collect();
    let packaging_basis: Vec<i64> = basis
        .iter()
        .map(|b| b.preliminary.map_or(average, |w| w.grams().max(0)))
        .collect();

    let nets = distribute(targets.net().grams(), &net_basis);
    let packaging = distribute(targets.gross().grams() - targets.net().grams(), &packaging_basis);
    nets.into_iter()
        .zip(packaging)
        .map(|(net, pack)| (Weight::from_grams(net), Weight::from_grams(net + pack)))
        .collect()
}

/// Deterministic correction of proposed weights to the exact targets.
///
/// 1. Negative values are clipped to zero and gross is raised to net.
/// 2. Net: each item's share of the target is proportional to its proposed
///    net, so the net delta lands proportionally on current values.
/// 3. Packaging (gross minus net): the target packaging is split in
///    proportion to each item's proposed packaging, with a floor of one gram
///    so every item can carry some.
/// 4. Gross is net plus packaging, so gross >= net holds for every item.
///
/// Rounding residue in steps 2 and 3 goes to the item with the largest share
/// basis (lowest index on ties).
pub fn correct(proposed: &[WeightPair], targets: Targets) -> Vec<WeightPair> {
    if proposed.is_empty() {
        return Vec::new();
    }

    let clipped: Vec<(i64, i64)> = proposed
        .iter()
        .map(|(net, gross)| {
            let net = net.grams().max(0);
            (net, gross.grams().max(net))
        })
        .collect();

    let nets: Vec<i64> = clipped.iter().map(|&(net, _)| net).collect();
    let packaging_basis: Vec<i64> = clipped.iter().map(|&(net, gross)| (gross - net).max(1)).collect();

    let target_net = targets.net().grams();
    let target_packaging = targets.gross().grams() - target_net;

    let proposed_net: i128 = nets.iter().map(|&n| i128::from(n)).sum();
    let proposed_gross: i128 = clipped.iter().map(|&(_, g)| i128::from(g)).sum();
    debug!(
        net_delta = %(i128::from(target_net) - proposed_net),
        gross_delta = %(i128::from(targets.gross().grams()) - proposed_gross),
        "Correcting proposed weights"
    );

    let new_nets = distribute(target_net, &nets);
    let packaging = distribute(target_packaging, &packaging_basis);

    new_nets
        .into_iter()
        .zip(packaging)
        .map(|(net, pack)| (Weight::from_grams(net), Weight::from_grams(net + pack)))
        .collect()
}

/// Split `total` grams in proportion to `basis`, exactly.
///
/// Shares are floored; the residue goes to the largest basis entry. An
/// all-zero basis splits equally.
fn distribute(total: i64, basis: &[i64]) -> Vec<i64> {
    if basis.is_empty() {
        return Vec::new();
    }
    let uniform;
    let basis = if basis.iter().all(|&b| b <= 0) {
        uniform = vec![1; basis.len()];
        &uniform
    } else {
        basis
    };
    let sum: i128 = basis.iter().map(|&b| i128::from(b.max(0))).sum();

    let mut shares: Vec<i64> = basis
        .iter()
        .map(|&b| (i128::from(total) * i128::from(b.max(0)) / sum) as i64)
        .collect();

    let residue = total - shares.iter().sum::<i64>();
    if residue != 0 {
        let largest = basis
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        shares[largest] += residue;
    }
    shares
}
