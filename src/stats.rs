//! 지연 샘플 통계

use std::time::Duration;

/// 반복 측정 샘플 모음
///
/// 성공한 샘플(밀리초)과 전체 시도 횟수를 함께 기록한다.
/// 실패한 시도는 평균/분산에 포함되지 않는다.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    /// 성공 샘플 (밀리초)
    samples: Vec<f64>,

    /// 전체 시도 횟수
    attempts: usize,
}

impl SampleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 성공 샘플 목록으로 생성 (모든 시도가 성공한 경우)
    pub fn from_millis(samples: &[f64]) -> Self {
        Self {
            samples: samples.to_vec(),
            attempts: samples.len(),
        }
    }

    /// 성공 샘플 기록
    pub fn record(&mut self, rtt: Duration) {
        self.record_millis(rtt.as_nanos() as f64 / 1_000_000.0);
    }

    /// 성공 샘플 기록 (밀리초)
    pub fn record_millis(&mut self, ms: f64) {
        self.samples.push(ms);
        self.attempts += 1;
    }

    /// 실패한 시도 기록
    pub fn record_failure(&mut self) {
        self.attempts += 1;
    }

    /// 다른 샘플 모음 병합
    pub fn merge(&mut self, other: SampleSet) {
        self.samples.extend(other.samples);
        self.attempts += other.attempts;
    }

    pub fn successes(&self) -> usize {
        self.samples.len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// 평균 지연 (밀리초)
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// 모분산
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        let sum_sq: f64 = self.samples.iter().map(|s| (s - mean) * (s - mean)).sum();
        Some(sum_sq / self.samples.len() as f64)
    }

    /// 연결 성공률 (0.0 ~ 1.0)
    pub fn connectivity(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.attempts as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_variance() {
        let set = SampleSet::from_millis(&[10.0, 20.0, 30.0]);
        assert_eq!(set.mean(), Some(20.0));
        let var = set.variance().unwrap();
        assert!((var - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(set.connectivity(), 1.0);
    }

    #[test]
    fn test_failures_excluded_from_mean() {
        let mut set = SampleSet::new();
        set.record(Duration::from_millis(40));
        set.record_failure();
        set.record_millis(60.0);
        set.record_failure();

        assert_eq!(set.successes(), 2);
        assert_eq!(set.attempts(), 4);
        assert_eq!(set.mean(), Some(50.0));
        assert_eq!(set.connectivity(), 0.5);
    }

    #[test]
    fn test_empty() {
        let mut set = SampleSet::new();
        assert!(set.mean().is_none());
        assert!(set.variance().is_none());
        assert_eq!(set.connectivity(), 0.0);

        set.record_failure();
        assert!(set.is_empty());
        assert_eq!(set.connectivity(), 0.0);
    }

    #[test]
    fn test_merge() {
        let mut a = SampleSet::from_millis(&[10.0]);
        let mut b = SampleSet::new();
        b.record_failure();
        b.record_millis(30.0);
        a.merge(b);
        assert_eq!(a.attempts(), 3);
        assert_eq!(a.mean(), Some(20.0));
    }
}
