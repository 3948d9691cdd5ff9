//! Rule tables that decide what a peer may receive or send.
//!
//! Tables are built once at configuration load and only read afterwards, so
//! an [`AccessControl`] is shared between sessions behind an `Arc`.

use std::sync::Arc;

use feedline_core::{Feedtype, FeedtypeDb, Pattern, ProductClass, ProductInfo, ProductSpec};
use feedline_transport::PeerId;
use tracing::{debug, info};

use crate::host::HostMatcher;
use crate::requests::{RequestRule, RequestTable};

/// Products a matching host may request.
#[derive(Debug, Clone)]
pub struct AllowRule {
    pub feedtype: Feedtype,
    pub host: HostMatcher,
    /// Identifiers a delivered product must match.
    pub ok_pattern: Pattern,
    /// Identifiers that are never delivered.
    pub not_pattern: Option<Pattern>,
}

/// Products a matching host may offer.
#[derive(Debug, Clone)]
pub struct AcceptRule {
    pub feedtype: Feedtype,
    pub pattern: Pattern,
    pub host: HostMatcher,
    /// Offered products should arrive as single messages.
    pub is_primary: bool,
}

/// One component of a delivery filter, taken from the first allow rule that
/// fired for a requested spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterComponent {
    pub feedtype: Feedtype,
    pub ok_pattern: Pattern,
    pub not_pattern: Option<Pattern>,
}

impl FilterComponent {
    fn matches(&self, db: &FeedtypeDb, info: &ProductInfo) -> bool {
        db.matches(self.feedtype, info.feedtype).unwrap_or(false)
            && self.ok_pattern.is_match(&info.ident)
            && !self
                .not_pattern
                .as_ref()
                .is_some_and(|not| not.is_match(&info.ident))
    }
}

/// Per-peer filter applied to every product before it is delivered.
#[derive(Debug, Clone)]
pub struct DeliveryFilter {
    components: Vec<FilterComponent>,
    feedtypes: Arc<FeedtypeDb>,
}

impl DeliveryFilter {
    pub fn components(&self) -> &[FilterComponent] {
        &self.components
    }

    pub fn matches(&self, info: &ProductInfo) -> bool {
        self.components
            .iter()
            .any(|component| component.matches(&self.feedtypes, info))
    }
}

/// Result of reducing an offer against the accept rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedOffer {
    pub class: ProductClass,
    /// Some fired rule asked for single-message delivery.
    pub is_primary: bool,
}

/// Compiled allow, accept and request tables over one feedtype table.
#[derive(Debug, Clone)]
pub struct AccessControl {
    feedtypes: Arc<FeedtypeDb>,
    allows: Vec<AllowRule>,
    accepts: Vec<AcceptRule>,
    requests: RequestTable,
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::with_feedtypes(Arc::new(FeedtypeDb::standard()))
    }
}

impl AccessControl {
    /// Empty tables over the standard feedtypes.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feedtypes(feedtypes: Arc<FeedtypeDb>) -> Self {
        Self {
            feedtypes,
            allows: Vec::new(),
            accepts: Vec::new(),
            requests: RequestTable::default(),
        }
    }

    pub fn feedtypes(&self) -> &Arc<FeedtypeDb> {
        &self.feedtypes
    }

    pub fn add_allow(&mut self, rule: AllowRule) {
        self.allows.push(rule);
    }

    pub fn add_accept(&mut self, rule: AcceptRule) {
        self.accepts.push(rule);
    }

    pub fn add_request(&mut self, rule: RequestRule) {
        self.requests.add(&self.feedtypes, rule);
    }

    pub fn allows(&self) -> &[AllowRule] {
        &self.allows
    }

    pub fn accepts(&self) -> &[AcceptRule] {
        &self.accepts
    }

    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    /// Coarse gate: any allow or accept rule names the peer.
    pub fn is_host_allowed(&self, peer: &PeerId) -> bool {
        self.allows.iter().any(|rule| rule.host.matches(peer))
            || self.accepts.iter().any(|rule| rule.host.matches(peer))
    }

    /// Table intersection; combinations the table has no entry for count
    /// as empty.
    fn intersect(&self, a: Feedtype, b: Feedtype) -> Feedtype {
        self.feedtypes.intersect(a, b).unwrap_or_else(|err| {
            debug!("No intersection of {} and {}: {}", self.format(a), self.format(b), err);
            Feedtype::NONE
        })
    }

    fn format(&self, ft: Feedtype) -> String {
        self.feedtypes.format(ft)
    }

    /// Builds the filter for what `peer` asked for. `None` means no allow
    /// rule fired for any spec and delivery is refused.
    pub fn build_delivery_filter(
        &self,
        peer: &PeerId,
        wanted: &ProductClass,
    ) -> Option<DeliveryFilter> {
        let components: Vec<FilterComponent> = wanted
            .specs
            .iter()
            .filter_map(|spec| {
                self.allows
                    .iter()
                    .filter(|rule| rule.host.matches(peer))
                    .find_map(|rule| {
                        let feedtype = self.intersect(rule.feedtype, spec.feedtype);
                        (!feedtype.is_none()).then(|| FilterComponent {
                            feedtype,
                            ok_pattern: rule.ok_pattern.clone(),
                            not_pattern: rule.not_pattern.clone(),
                        })
                    })
            })
            .collect();
        (!components.is_empty()).then(|| DeliveryFilter {
            components,
            feedtypes: Arc::clone(&self.feedtypes),
        })
    }

    /// Feedtypes of the allow rules that name `peer`.
    pub fn allowed_feedtypes(&self, peer: &PeerId) -> Vec<Feedtype> {
        self.allows
            .iter()
            .filter(|rule| rule.host.matches(peer))
            .map(|rule| rule.feedtype)
            .collect()
    }

    /// Intersects `wanted` with each of `allowed` and joins the pieces
    /// wherever the table has an entry for their union. Pieces it cannot
    /// join stay separate.
    fn narrow_feedtype(&self, wanted: Feedtype, allowed: &[Feedtype]) -> Vec<Feedtype> {
        let mut pieces: Vec<Feedtype> = Vec::new();
        for limit in allowed {
            let piece = self.intersect(wanted, *limit);
            if piece.is_none() || pieces.contains(&piece) {
                continue;
            }
            let joined = pieces.iter_mut().any(|existing| {
                match self.feedtypes.union(*existing, piece) {
                    Ok(union) => {
                        *existing = union;
                        true
                    }
                    Err(_) => false,
                }
            });
            if !joined {
                pieces.push(piece);
            }
        }
        pieces
    }

    fn narrow(&self, peer: &PeerId, class: &ProductClass, allowed: &[Feedtype]) -> ProductClass {
        let mut reduced = class.emptied();
        for spec in &class.specs {
            let pieces = self.narrow_feedtype(spec.feedtype, allowed);
            if pieces != [spec.feedtype] {
                let to: Vec<String> = pieces.iter().map(|ft| self.format(*ft)).collect();
                info!(
                    "Reducing request for {} {:?} to {} for {peer}",
                    self.format(spec.feedtype),
                    spec.pattern.as_str(),
                    if to.is_empty() { "NONE".to_string() } else { to.join(", ") }
                );
            }
            for feedtype in pieces {
                let piece = ProductSpec {
                    feedtype,
                    pattern: spec.pattern.clone(),
                };
                if !reduced.specs.contains(&piece) {
                    reduced.specs.push(piece);
                }
            }
        }
        reduced
    }

    /// Narrows every spec to the feedtypes `peer` may request. Specs that
    /// end up empty are dropped; the result never asks for more than
    /// `class`.
    pub fn reduce_subscription(&self, peer: &PeerId, class: &ProductClass) -> ProductClass {
        self.narrow(peer, class, &self.allowed_feedtypes(peer))
    }

    /// Reduces a class that `peer` switched to in mid-session: first to
    /// what `admitted` already granted, then by the allow rules.
    pub fn reduce_reclassification(
        &self,
        peer: &PeerId,
        admitted: &ProductClass,
        class: &ProductClass,
    ) -> ProductClass {
        let granted: Vec<Feedtype> = admitted.specs.iter().map(|spec| spec.feedtype).collect();
        let within = self.narrow(peer, class, &granted);
        self.reduce_subscription(peer, &within)
    }

    /// Reduces an offer from `peer` to what the accept rules take. For each
    /// rule that names the peer, the first offered spec sharing feedtypes
    /// contributes that intersection under the rule's pattern.
    pub fn reduce_to_acceptable(&self, peer: &PeerId, offered: &ProductClass) -> AcceptedOffer {
        let mut class = offered.emptied();
        let mut is_primary = false;
        for rule in self.accepts.iter().filter(|rule| rule.host.matches(peer)) {
            let Some(feedtype) = offered
                .specs
                .iter()
                .map(|spec| self.intersect(spec.feedtype, rule.feedtype))
                .find(|feedtype| !feedtype.is_none())
            else {
                continue;
            };
            let candidate = ProductSpec {
                feedtype,
                pattern: rule.pattern.clone(),
            };
            if !class.specs.contains(&candidate) {
                class.specs.push(candidate);
            }
            is_primary |= rule.is_primary;
        }
        AcceptedOffer { class, is_primary }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use feedline_core::{Feedtype, FeedtypeDb, Pattern, Product, ProductClass, ProductSpec, Timestamp};
    use feedline_transport::PeerId;

    use super::{AcceptRule, AccessControl, AllowRule};
    use crate::host::HostMatcher;

    const F1: Feedtype = Feedtype(1);
    const F2: Feedtype = Feedtype(2);

    fn h1() -> PeerId {
        PeerId::new("h1", "10.1.1.1")
    }

    fn allow(ft: Feedtype, host: &str, ok: &str, not: Option<&str>) -> AllowRule {
        AllowRule {
            feedtype: ft,
            host: HostMatcher::parse(host).expect("host"),
            ok_pattern: Pattern::new(ok).expect("ok"),
            not_pattern: not.map(|p| Pattern::new(p).expect("not")),
        }
    }

    fn class(specs: Vec<ProductSpec>) -> ProductClass {
        ProductClass::new(Timestamp::ZERO, Timestamp::END, specs)
    }

    fn info(ft: Feedtype, ident: &str) -> feedline_core::ProductInfo {
        Product::new(ft, ident, "origin", 0, Timestamp::from_secs(1), vec![1]).info
    }

    const L1: Feedtype = Feedtype(0x100);
    const L3: Feedtype = Feedtype(0x300);
    const L12: Feedtype = Feedtype(0x1000);
    const L123: Feedtype = Feedtype(0x2000);
    const L12X: Feedtype = Feedtype(0x3000);
    const X: Feedtype = Feedtype(1);

    fn value_db() -> Arc<FeedtypeDb> {
        let mut db = FeedtypeDb::new();
        db.add_bit("X", 0).expect("X");
        db.add_bit("Y", 1).expect("Y");
        db.add_leaf("L1", 0x100).expect("L1");
        db.add_leaf("L2", 0x200).expect("L2");
        db.add_leaf("L3", 0x300).expect("L3");
        db.add_value("L12", 0x1000, &["L1", "L2"], &[]).expect("L12");
        db.add_value("L123", 0x2000, &["L12", "L3"], &[]).expect("L123");
        db.add_value("L12X", 0x3000, &["L12", "X"], &[]).expect("L12X");
        Arc::new(db)
    }

    fn acl_for(db: &Arc<FeedtypeDb>, allows: &[Feedtype]) -> AccessControl {
        let mut acl = AccessControl::with_feedtypes(Arc::clone(db));
        for ft in allows {
            acl.add_allow(allow(*ft, "h1", ".*", None));
        }
        acl
    }

    #[test]
    fn allow_reduces_by_feedtype_only() {
        let mut acl = AccessControl::new();
        acl.add_allow(allow(F1 | F2, "h1", ".*", None));
        acl.add_accept(AcceptRule {
            feedtype: F1,
            pattern: Pattern::new("^X").expect("pattern"),
            host: HostMatcher::parse("h1").expect("host"),
            is_primary: true,
        });
        let offered = class(vec![ProductSpec::any(F1 | F2)]);
        assert_eq!(acl.reduce_subscription(&h1(), &offered), offered);
    }

    #[test]
    fn reduction_narrows_and_drops_specs() {
        let mut acl = AccessControl::new();
        acl.add_allow(allow(F1, "h1", ".*", None));
        acl.add_allow(allow(F2, "someone-else", ".*", None));
        let wanted = class(vec![
            ProductSpec::any(F1 | F2),
            ProductSpec::new(F2, "^A").expect("pattern"),
        ]);
        let reduced = acl.reduce_subscription(&h1(), &wanted);
        assert_eq!(reduced.specs, vec![ProductSpec::any(F1)]);
    }

    #[test]
    fn first_allow_rule_wins_per_spec() {
        let mut acl = AccessControl::new();
        acl.add_allow(allow(F1, "h1", "^R1", None));
        acl.add_allow(allow(F1 | F2, "h1", "^R2", Some("SKIP")));
        let filter = acl
            .build_delivery_filter(&h1(), &class(vec![ProductSpec::any(F1)]))
            .expect("filter");
        assert_eq!(filter.components().len(), 1);
        assert_eq!(filter.components()[0].ok_pattern.as_str(), "^R1");
        assert!(filter.matches(&info(F1, "R1 product")));
        assert!(!filter.matches(&info(F1, "R2 product")));

        let filter = acl
            .build_delivery_filter(&h1(), &class(vec![ProductSpec::any(F2)]))
            .expect("filter");
        assert!(filter.matches(&info(F2, "R2 keep")));
        assert!(!filter.matches(&info(F2, "R2 SKIP")));
    }

    #[test]
    fn no_firing_rule_refuses_delivery() {
        let mut acl = AccessControl::new();
        acl.add_allow(allow(F1, "other", ".*", None));
        assert!(acl
            .build_delivery_filter(&h1(), &class(vec![ProductSpec::any(F1)]))
            .is_none());
        assert!(!acl.is_host_allowed(&h1()));
        assert!(acl.is_host_allowed(&PeerId::new("OTHER", "10.9.9.9")));
    }

    #[test]
    fn offers_reduce_to_accept_patterns() {
        let mut acl = AccessControl::new();
        acl.add_accept(AcceptRule {
            feedtype: F1,
            pattern: Pattern::new("^X").expect("pattern"),
            host: HostMatcher::parse("h1").expect("host"),
            is_primary: true,
        });
        acl.add_accept(AcceptRule {
            feedtype: Feedtype(4),
            pattern: Pattern::any(),
            host: HostMatcher::parse("h1").expect("host"),
            is_primary: false,
        });
        let offer = acl.reduce_to_acceptable(&h1(), &class(vec![ProductSpec::any(F1 | F2)]));
        assert!(offer.is_primary);
        assert_eq!(offer.class.specs, vec![ProductSpec::new(F1, "^X").expect("pattern")]);

        let none = acl.reduce_to_acceptable(&PeerId::new("h2", "10.2.2.2"), &class(vec![ProductSpec::any(F1)]));
        assert!(none.class.is_empty());
        assert!(!none.is_primary);
    }

    #[test]
    fn value_feedtypes_are_allowed_through_the_table() {
        let acl = acl_for(&value_db(), &[L12]);
        let wanted = class(vec![ProductSpec::any(L1)]);
        let filter = acl.build_delivery_filter(&h1(), &wanted).expect("filter");
        assert_eq!(filter.components()[0].feedtype, L1);
        assert!(filter.matches(&info(L1, "A")));
        assert!(!filter.matches(&info(L3, "A")));
        assert_eq!(acl.reduce_subscription(&h1(), &wanted), wanted);

        let acl = acl_for(&value_db(), &[L12X]);
        let reduced = acl.reduce_subscription(&h1(), &class(vec![ProductSpec::any(L123)]));
        assert_eq!(reduced.specs, vec![ProductSpec::any(L12)]);
    }

    #[test]
    fn offers_reduce_through_the_table() {
        let mut acl = AccessControl::with_feedtypes(value_db());
        acl.add_accept(AcceptRule {
            feedtype: L12,
            pattern: Pattern::any(),
            host: HostMatcher::parse("h1").expect("host"),
            is_primary: false,
        });
        let offer = acl.reduce_to_acceptable(&h1(), &class(vec![ProductSpec::any(L123)]));
        assert_eq!(offer.class.specs, vec![ProductSpec::any(L12)]);
    }

    #[test]
    fn reduction_never_widens_and_is_stable() {
        let standard = Arc::new(FeedtypeDb::standard());
        let values = value_db();
        let (pps, dds, hds, ids) = (Feedtype(1), Feedtype(2), Feedtype(4), Feedtype(8));
        let wmo = pps | dds | hds;
        let cases: Vec<(&Arc<FeedtypeDb>, Vec<Feedtype>, Feedtype, Vec<Feedtype>)> = vec![
            (&standard, vec![Feedtype::ANY], dds | hds, vec![dds | hds]),
            (&standard, vec![pps | dds], Feedtype::ANY, vec![pps | dds]),
            (&standard, vec![pps, hds], wmo, vec![pps | hds]),
            (&standard, vec![ids], wmo, vec![]),
            (&values, vec![L12], L1, vec![L1]),
            (&values, vec![L1], L123, vec![L1]),
            (&values, vec![L12, L3], L123, vec![L123]),
            (&values, vec![L1, X], L12X, vec![L1, X]),
            (&values, vec![L3], L12, vec![]),
            (&values, vec![Feedtype::ANY], L12X, vec![L12X]),
        ];
        for (db, allows, wanted, expected) in cases {
            let acl = acl_for(db, &allows);
            let wanted_class = class(vec![ProductSpec::any(wanted)]);
            let reduced = acl.reduce_subscription(&h1(), &wanted_class);
            let got: Vec<Feedtype> = reduced.specs.iter().map(|spec| spec.feedtype).collect();
            assert_eq!(got, expected, "allow {allows:?} want {wanted:?}");
            for spec in &reduced.specs {
                assert_eq!(db.covers(wanted, spec.feedtype), Ok(true), "{spec} within {wanted:?}");
            }
            assert_eq!(acl.reduce_subscription(&h1(), &reduced), reduced, "allow {allows:?} want {wanted:?}");
        }
    }

    #[test]
    fn reclassification_stays_within_what_was_admitted() {
        let mut acl = AccessControl::new();
        acl.add_allow(allow(F1 | F2 | Feedtype(4), "h1", ".*", None));
        let admitted = class(vec![ProductSpec::any(F1 | F2)]);
        let asked = class(vec![ProductSpec::any(F2 | Feedtype(4))]);
        let reduced = acl.reduce_reclassification(&h1(), &admitted, &asked);
        assert_eq!(reduced.specs, vec![ProductSpec::any(F2)]);
    }
}
