//! Command plan composition.
//!
//! Turns a [`Transaction`] into the non-empty ordered command sequence that
//! realizes it on a session. Composition is pure: no I/O, no session state.

use itertools::Itertools;
use nonempty::{nonempty, NonEmpty};

use crate::transaction::{Command, Transaction};

/// Alias every transaction binds its dataset under.
///
/// Sessions are single-tenant while checked out and the alias space is wiped
/// by the reset sequence, so one well-known name is enough.
pub const WELL_KNOWN_ALIAS: &str = "d1";

pub struct TransactionComposer;

impl TransactionComposer {
    /// Composes the command plan for one transaction.
    ///
    /// Catalog products need no dataset bind and compose to a single `show`.
    /// Everything else composes to bind, define, get.
    pub fn compose(tx: &Transaction) -> NonEmpty<Command> {
        if tx.product.uses_show() {
            return nonempty![Command::Show {
                product: tx.product,
                dataset: tx.show_scope().map(str::to_owned),
            }];
        }

        nonempty![
            Command::SetContainer {
                alias: WELL_KNOWN_ALIAS.into(),
                dataset: tx.dataset_id.clone(),
                type_hint: tx.type_hint.clone(),
            },
            Command::Define {
                alias: WELL_KNOWN_ALIAS.into(),
                dataset: tx.dataset_id.clone(),
                constraint: tx.constraint.clone(),
            },
            Command::Get {
                product: tx.product,
                alias: WELL_KNOWN_ALIAS.into(),
                form_url: tx.form_url.clone(),
            },
        ]
    }

    /// Commands that scrub all per-session backend state, in the order the
    /// backend expects: definitions first, then the containers they refer to.
    pub fn reset_sequence() -> [Command; 2] {
        [Command::DeleteDefinitions, Command::DeleteContainers]
    }

    /// One-line plan summary for debug logs.
    pub fn describe(plan: &NonEmpty<Command>) -> String {
        plan.iter().map(Command::verb).join(" > ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Product;

    #[test]
    fn data_products_compose_to_bind_define_get() {
        let tx = Transaction::new("/data/nc/fnoc1.nc", Product::BinaryData)
            .with_constraint("u,v");
        let plan = TransactionComposer::compose(&tx);

        assert_eq!(plan.len(), 3);
        assert_eq!(
            plan.head.to_string(),
            "set container in catalog values d1, /data/nc/fnoc1.nc;"
        );
        assert_eq!(
            plan.tail[0].to_string(),
            "define d1 as /data/nc/fnoc1.nc with /data/nc/fnoc1.nc.constraint=\"u,v\";"
        );
        assert_eq!(plan.tail[1].to_string(), "get dods for d1;");
    }

    #[test]
    fn empty_constraint_is_omitted_from_define() {
        let tx = Transaction::new("/data/nc/fnoc1.nc", Product::DescriptorStructure)
            .with_constraint("");
        let plan = TransactionComposer::compose(&tx);
        assert_eq!(plan.tail[0].to_string(), "define d1 as /data/nc/fnoc1.nc;");
    }

    #[test]
    fn version_info_composes_to_a_bare_show() {
        let plan = TransactionComposer::compose(&Transaction::show(Product::VersionInfo));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.head.to_string(), "show version;");
    }

    #[test]
    fn catalog_info_scopes_to_the_dataset_when_present() {
        let plan =
            TransactionComposer::compose(&Transaction::new("/data/nc", Product::CatalogInfo));
        assert_eq!(plan.head.to_string(), "show catalog for \"/data/nc\";");

        let unscoped = TransactionComposer::compose(&Transaction::show(Product::CatalogInfo));
        assert_eq!(unscoped.head.to_string(), "show catalog;");
    }

    #[test]
    fn reset_deletes_definitions_before_containers() {
        let [first, second] = TransactionComposer::reset_sequence();
        assert_eq!(first, Command::DeleteDefinitions);
        assert_eq!(second, Command::DeleteContainers);
    }

    #[test]
    fn describe_summarizes_the_plan() {
        let tx = Transaction::new("/data/x.nc", Product::AsciiRendering);
        let plan = TransactionComposer::compose(&tx);
        assert_eq!(
            TransactionComposer::describe(&plan),
            "set-container > define > get"
        );
    }
}
