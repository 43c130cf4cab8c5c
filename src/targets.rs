// src/targets.rs

use crate::error::Result;
use crate::locale::parse_decimal;
use crate::model::{Invoice, Targets, Weight};
use std::io::{BufRead, Write};
use tracing::{info, warn};

/// Supplies the target total weights for an invoice, once all its items are
/// known. `None` skips reconciliation for that invoice.
pub trait TargetSource {
    fn targets_for(&mut self, invoice: &Invoice) -> Result<Option<Targets>>;
}

/// Asks an operator on a terminal: gross first, then net.
pub struct PromptTargets<R, W> {
    input: R,
    output: W,
}

impl PromptTargets<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdin() -> Self {
        PromptTargets::new(std::io::stdin().lock(), std::io::stdout())
    }
}

enum Answer {
    Value(Weight),
    Skip,
}

impl<R: BufRead, W: Write> PromptTargets<R, W> {
    pub fn new(input: R, output: W) -> Self {
        PromptTargets { input, output }
    }

    /// Ask until a weight or an empty line (skip) arrives. EOF skips.
    fn ask(&mut self, question: &str) -> Result<Answer> {
        loop {
            write!(self.output, "{question} [kg, empty = skip]: ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(Answer::Skip);
            }
            let line = line.trim();
            if line.is_empty() {
                return Ok(Answer::Skip);
            }
            match parse_decimal(line).and_then(Weight::from_kg) {
                Some(weight) if weight >= Weight::ZERO => return Ok(Answer::Value(weight)),
                _ => writeln!(self.output, "  '{line}' is not a weight, try again (e.g. 12,5)")?,
            }
        }
    }
}

impl<R: BufRead, W: Write> TargetSource for PromptTargets<R, W> {
    fn targets_for(&mut self, invoice: &Invoice) -> Result<Option<Targets>> {
        let preliminary: Weight = invoice
            .items
            .iter()
            .filter_map(|i| i.preliminary_net_weight.known())
            .sum();
        writeln!(
            self.output,
            "\nInvoice {} ({}): {} rows, preliminary net weight {} kg",
            invoice.number,
            invoice.source_file,
            invoice.items.len(),
            preliminary
        )?;

        let gross = match self.ask("Target total GROSS weight")? {
            Answer::Value(w) => w,
            Answer::Skip => {
                info!(invoice = %invoice.number, "No target weights entered, skipping reconciliation");
                return Ok(None);
            }
        };
        let net = match self.ask("Target total NET weight")? {
            Answer::Value(w) => w,
            Answer::Skip => {
                info!(invoice = %invoice.number, "No net target entered, skipping reconciliation");
                return Ok(None);
            }
        };

        match Targets::new(net, gross) {
            Ok(targets) => Ok(Some(targets)),
            Err(e) => {
                warn!(invoice = %invoice.number, error = %e, "Rejected target weights, invoice left unreconciled");
                writeln!(self.output, "  {e}")?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LineItem, PreliminaryWeight};
    use std::io::Cursor;

    fn invoice() -> Invoice {
        let mut invoice = Invoice::new("a.pdf", "FV-1");
        let mut item = LineItem::new("FV-1", 1);
        item.preliminary_net_weight = PreliminaryWeight::Known(Weight::from_grams(1_500));
        invoice.push_page(vec![item]);
        invoice
    }

    fn answer(input: &str) -> (Option<Targets>, String) {
        let mut output = Vec::new();
        let targets = PromptTargets::new(Cursor::new(input.to_string()), &mut output)
            .targets_for(&invoice())
            .unwrap();
        (targets, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_gross_then_net() {
        let (targets, output) = answer("20,5\n18\n");
        let targets = targets.unwrap();
        assert_eq!(targets.gross(), Weight::from_grams(20_500));
        assert_eq!(targets.net(), Weight::from_grams(18_000));
        assert!(output.contains("preliminary net weight 1.500 kg"));
        assert!(output.find("GROSS").unwrap() < output.find("NET weight [").unwrap());
    }

    #[test]
    fn test_retry_on_garbage() {
        let (targets, output) = answer("abc\n-3\n20\n18\n");
        assert!(targets.is_some());
        assert_eq!(output.matches("is not a weight").count(), 2);
    }

    #[test]
    fn test_empty_or_eof_skips() {
        assert_eq!(answer("\n").0, None);
        assert_eq!(answer("20\n").0, None);
        assert_eq!(answer("").0, None);
    }

    #[test]
    fn test_gross_below_net_is_rejected() {
        let (targets, output) = answer("10\n12\n");
        assert_eq!(targets, None);
        assert!(output.contains("below net target"));
    }
}
