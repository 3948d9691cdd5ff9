use feedline_core::{Feedtype, FeedtypeDb, Pattern, ProductClass, ProductSpec, Timestamp};
use tracing::warn;

/// Declared subscription to an upstream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRule {
    pub feedtype: Feedtype,
    pub pattern: Pattern,
    pub server: String,
    pub port: u16,
}

impl RequestRule {
    fn same_server(&self, other: &RequestRule) -> bool {
        self.port == other.port && self.server.eq_ignore_ascii_case(&other.server)
    }
}

/// One subscription and every server it is requested from, in
/// declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAggregate {
    pub spec: ProductSpec,
    pub servers: Vec<(String, u16)>,
}

/// Everything one requester task needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterPlan {
    pub server: String,
    pub port: u16,
    pub class: ProductClass,
    /// The first server declared for a subscription starts as primary.
    pub is_primary: bool,
    /// Servers feeding the same subscription; the autoshift peer count.
    pub feed_count: u32,
}

/// Request declarations after overlap reduction.
#[derive(Debug, Clone, Default)]
pub struct RequestTable {
    rules: Vec<RequestRule>,
}

impl RequestTable {
    /// Adds a declaration. A request that overlaps an earlier one for the
    /// same pattern and server is narrowed by it, and dropped when nothing
    /// is left. Returns whether anything was added.
    pub fn add(&mut self, db: &FeedtypeDb, mut rule: RequestRule) -> bool {
        for existing in &self.rules {
            if !existing.same_server(&rule)
                || existing.pattern != rule.pattern
                || !db.matches(existing.feedtype, rule.feedtype).unwrap_or(false)
            {
                continue;
            }
            match db.difference(rule.feedtype, existing.feedtype) {
                Ok(narrowed) => {
                    warn!(
                        "Request for {} \"{}\" from {} overlaps an earlier one; reduced to {}",
                        db.format(rule.feedtype),
                        rule.pattern,
                        rule.server,
                        db.format(narrowed)
                    );
                    rule.feedtype = narrowed;
                }
                Err(err) => warn!(
                    "Request for {} \"{}\" from {} overlaps an earlier one: {}",
                    db.format(rule.feedtype),
                    rule.pattern,
                    rule.server,
                    err
                ),
            }
        }
        if rule.feedtype.is_none() {
            warn!(
                "Ignoring request for \"{}\" from {}: nothing left after overlap reduction",
                rule.pattern, rule.server
            );
            return false;
        }
        self.rules.push(rule);
        true
    }

    pub fn rules(&self) -> &[RequestRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Groups declarations by subscription, keeping first-seen order.
    pub fn aggregates(&self) -> Vec<SubscriptionAggregate> {
        let mut out: Vec<SubscriptionAggregate> = Vec::new();
        for rule in &self.rules {
            let spec = ProductSpec {
                feedtype: rule.feedtype,
                pattern: rule.pattern.clone(),
            };
            let server = (rule.server.clone(), rule.port);
            match out.iter_mut().find(|agg| agg.spec == spec) {
                Some(agg) if !agg.servers.contains(&server) => agg.servers.push(server),
                Some(_) => {}
                None => out.push(SubscriptionAggregate {
                    spec,
                    servers: vec![server],
                }),
            }
        }
        out
    }

    /// One requester per (subscription, server).
    pub fn plans(&self) -> Vec<RequesterPlan> {
        self.aggregates()
            .into_iter()
            .flat_map(|agg| {
                let feed_count = u32::try_from(agg.servers.len()).unwrap_or(u32::MAX);
                let spec = agg.spec;
                agg.servers
                    .into_iter()
                    .enumerate()
                    .map(move |(index, (server, port))| RequesterPlan {
                        server,
                        port,
                        class: ProductClass::new(Timestamp::ZERO, Timestamp::END, vec![spec.clone()]),
                        is_primary: index == 0,
                        feed_count,
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use feedline_core::{Feedtype, FeedtypeDb, Pattern};

    use super::{RequestRule, RequestTable};

    fn rule(ft: u32, pattern: &str, server: &str) -> RequestRule {
        RequestRule {
            feedtype: Feedtype(ft),
            pattern: Pattern::new(pattern).expect("pattern"),
            server: server.to_string(),
            port: 388,
        }
    }

    #[test]
    fn same_subscription_from_two_servers_aggregates() {
        let db = FeedtypeDb::standard();
        let mut table = RequestTable::default();
        assert!(table.add(&db, rule(0b11, ".*", "a.example")));
        assert!(table.add(&db, rule(0b11, ".*", "b.example")));
        assert!(table.add(&db, rule(0b100, "^SA", "a.example")));

        let aggregates = table.aggregates();
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].servers.len(), 2);

        let plans = table.plans();
        assert_eq!(plans.len(), 3);
        assert!(plans[0].is_primary);
        assert_eq!(plans[0].feed_count, 2);
        assert!(!plans[1].is_primary);
        assert_eq!(plans[1].server, "b.example");
        assert!(plans[2].is_primary);
        assert_eq!(plans[2].feed_count, 1);
    }

    #[test]
    fn overlap_to_same_server_is_reduced_or_dropped() {
        let db = FeedtypeDb::standard();
        let mut table = RequestTable::default();
        assert!(table.add(&db, rule(0b011, ".*", "a.example")));
        assert!(table.add(&db, rule(0b110, ".*", "A.EXAMPLE")));
        assert_eq!(table.rules()[1].feedtype, Feedtype(0b100));
        assert!(!table.add(&db, rule(0b001, ".*", "a.example")));
        assert!(table.add(&db, rule(0b001, "^SA", "a.example")));
        assert_eq!(table.rules().len(), 3);
    }

    #[test]
    fn value_overlap_is_reduced_through_the_table() {
        let mut db = FeedtypeDb::new();
        db.add_leaf("L1", 0x100).expect("L1");
        db.add_leaf("L2", 0x200).expect("L2");
        db.add_value("L12", 0x1000, &["L1", "L2"], &[]).expect("L12");
        let mut table = RequestTable::default();
        assert!(table.add(&db, rule(0x100, ".*", "a.example")));
        assert!(table.add(&db, rule(0x1000, ".*", "a.example")));
        assert_eq!(table.rules()[1].feedtype, Feedtype(0x200));
        assert!(!table.add(&db, rule(0x100, ".*", "a.example")));
    }
}
