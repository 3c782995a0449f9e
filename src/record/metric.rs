/// Per-service call metric for one time bucket.
///
/// Identity is `timeBucket_service`; every measure below the id fields is
/// additive or an extremum, so merging any permutation of the same inputs
/// yields the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMetric {
    pub id: String,
    pub time_bucket: i64,
    pub service: String,
    pub calls: i64,
    pub error_calls: i64,
    /// Total latency in milliseconds across all merged calls.
    pub duration_sum: i64,
    pub duration_max: i64,
    pub duration_min: i64,
}

impl ServiceMetric {
    pub fn record_id(service: &str, time_bucket: i64) -> String {
        format!("{time_bucket}_{service}")
    }

    pub fn merge(&mut self, other: &Self) {
        if self.service.is_empty() {
            self.service = other.service.clone();
        }
        self.calls += other.calls;
        self.error_calls += other.error_calls;
        self.duration_sum += other.duration_sum;
        self.duration_max = self.duration_max.max(other.duration_max);
        self.duration_min = self.duration_min.min(other.duration_min);
    }
}

/// Per-instance call metric for one time bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMetric {
    pub id: String,
    pub time_bucket: i64,
    /// First-write field: copied from the first record seen for this id.
    pub service: String,
    pub instance: String,
    pub calls: i64,
    pub error_calls: i64,
    pub duration_sum: i64,
    pub duration_max: i64,
    pub duration_min: i64,
}

impl InstanceMetric {
    pub fn record_id(service: &str, instance: &str, time_bucket: i64) -> String {
        format!("{time_bucket}_{service}_{instance}")
    }

    pub fn merge(&mut self, other: &Self) {
        if self.service.is_empty() {
            self.service = other.service.clone();
        }
        if self.instance.is_empty() {
            self.instance = other.instance.clone();
        }
        self.calls += other.calls;
        self.error_calls += other.error_calls;
        self.duration_sum += other.duration_sum;
        self.duration_max = self.duration_max.max(other.duration_max);
        self.duration_min = self.duration_min.min(other.duration_min);
    }
}

/// Per-endpoint call metric for one time bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMetric {
    pub id: String,
    pub time_bucket: i64,
    pub service: String,
    /// First-write field: the human-readable endpoint name.
    pub endpoint: String,
    pub calls: i64,
    pub error_calls: i64,
    pub duration_sum: i64,
    pub duration_max: i64,
    pub duration_min: i64,
}

impl EndpointMetric {
    pub fn record_id(service: &str, endpoint: &str, time_bucket: i64) -> String {
        format!("{time_bucket}_{service}_{endpoint}")
    }

    pub fn merge(&mut self, other: &Self) {
        if self.service.is_empty() {
            self.service = other.service.clone();
        }
        if self.endpoint.is_empty() {
            self.endpoint = other.endpoint.clone();
        }
        self.calls += other.calls;
        self.error_calls += other.error_calls;
        self.duration_sum += other.duration_sum;
        self.duration_max = self.duration_max.max(other.duration_max);
        self.duration_min = self.duration_min.min(other.duration_min);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(calls: i64, max: i64, min: i64) -> ServiceMetric {
        ServiceMetric {
            id: ServiceMetric::record_id("checkout", 202401010000),
            time_bucket: 202401010000,
            service: "checkout".to_string(),
            calls,
            error_calls: calls / 2,
            duration_sum: calls * 5,
            duration_max: max,
            duration_min: min,
        }
    }

    #[test]
    fn test_service_metric_merge_extrema() {
        let mut a = sample(4, 100, 20);
        let b = sample(2, 250, 5);
        a.merge(&b);

        assert_eq!(a.calls, 6);
        assert_eq!(a.error_calls, 3);
        assert_eq!(a.duration_sum, 30);
        assert_eq!(a.duration_max, 250);
        assert_eq!(a.duration_min, 5);
    }

    #[test]
    fn test_record_id_composition() {
        assert_eq!(
            ServiceMetric::record_id("checkout", 202401010000),
            "202401010000_checkout"
        );
        assert_eq!(
            InstanceMetric::record_id("checkout", "checkout-1", 202401010000),
            "202401010000_checkout_checkout-1"
        );
        assert_eq!(
            EndpointMetric::record_id("checkout", "/pay", 202401010000),
            "202401010000_checkout_/pay"
        );
    }

    #[test]
    fn test_instance_metric_first_write_fields() {
        let mut blank = InstanceMetric {
            id: InstanceMetric::record_id("checkout", "checkout-1", 202401010000),
            time_bucket: 202401010000,
            service: String::new(),
            instance: String::new(),
            calls: 1,
            error_calls: 0,
            duration_sum: 3,
            duration_max: 3,
            duration_min: 3,
        };
        let named = InstanceMetric {
            service: "checkout".to_string(),
            instance: "checkout-1".to_string(),
            ..blank.clone()
        };

        blank.merge(&named);
        assert_eq!(blank.service, "checkout");
        assert_eq!(blank.instance, "checkout-1");

        // A later merge must not overwrite the already-set names.
        let other = InstanceMetric {
            service: "other".to_string(),
            instance: "other-9".to_string(),
            ..named
        };
        blank.merge(&other);
        assert_eq!(blank.service, "checkout");
        assert_eq!(blank.instance, "checkout-1");
    }
}
