/// Directed topology edge between two services for one time bucket.
///
/// Built from span facts whose caller is known; identity is
/// `timeBucket_source_dest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRelation {
    pub id: String,
    pub time_bucket: i64,
    pub source_service: String,
    pub dest_service: String,
    pub calls: i64,
    pub error_calls: i64,
    pub duration_sum: i64,
}

impl ServiceRelation {
    pub fn record_id(source: &str, dest: &str, time_bucket: i64) -> String {
        format!("{time_bucket}_{source}_{dest}")
    }

    pub fn merge(&mut self, other: &Self) {
        if self.source_service.is_empty() {
            self.source_service = other.source_service.clone();
        }
        if self.dest_service.is_empty() {
            self.dest_service = other.dest_service.clone();
        }
        self.calls += other.calls;
        self.error_calls += other.error_calls;
        self.duration_sum += other.duration_sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_merge() {
        let mut a = ServiceRelation {
            id: ServiceRelation::record_id("gateway", "checkout", 202401010000),
            time_bucket: 202401010000,
            source_service: "gateway".to_string(),
            dest_service: "checkout".to_string(),
            calls: 3,
            error_calls: 1,
            duration_sum: 42,
        };
        let b = ServiceRelation { calls: 2, error_calls: 0, duration_sum: 8, ..a.clone() };

        a.merge(&b);
        assert_eq!(a.calls, 5);
        assert_eq!(a.error_calls, 1);
        assert_eq!(a.duration_sum, 50);
        assert_eq!(a.id, "202401010000_gateway_checkout");
    }
}
