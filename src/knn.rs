//! Exact k-nearest-neighbour classification over a 2D axis pair. Training
//! sets are bounded upstream (see `fmo`), so a brute-force scan is cheap
//! and keeps predictions fully deterministic.

use crate::error::GatingError;

#[derive(Debug, Clone)]
pub struct KnnClassifier {
    k: usize,
    points: Vec<[f64; 2]>,
    labels: Vec<bool>,
}

impl KnnClassifier {
    pub fn fit(k: usize, points: Vec<[f64; 2]>, labels: Vec<bool>) -> Result<Self, GatingError> {
        if k == 0 {
            return Err(GatingError::validation("KNN requires k >= 1"));
        }
        if points.is_empty() {
            return Err(GatingError::validation(
                "KNN requires a non-empty training set",
            ));
        }
        if points.len() != labels.len() {
            return Err(GatingError::internal(format!(
                "KNN training points ({}) and labels ({}) differ in length",
                points.len(),
                labels.len()
            )));
        }
        Ok(Self { k, points, labels })
    }

    /// Majority vote among the k nearest training points. Distance ties
    /// break on training order; an even split votes negative.
    pub fn predict(&self, query: [f64; 2]) -> bool {
        let k = self.k.min(self.points.len());
        // Small sorted buffer of (squared distance, index).
        let mut nearest: Vec<(f64, usize)> = Vec::with_capacity(k + 1);
        for (i, p) in self.points.iter().enumerate() {
            let dx = p[0] - query[0];
            let dy = p[1] - query[1];
            let d = dx * dx + dy * dy;
            if nearest.len() == k && d >= nearest[k - 1].0 {
                continue;
            }
            let pos = nearest
                .partition_point(|(nd, ni)| *nd < d || (*nd == d && *ni < i));
            nearest.insert(pos, (d, i));
            nearest.truncate(k);
        }
        let positives = nearest.iter().filter(|(_, i)| self.labels[*i]).count();
        positives * 2 > k
    }

    pub fn predict_many(&self, queries: &[[f64; 2]]) -> Vec<bool> {
        queries.iter().map(|q| self.predict(*q)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_cluster_separation() {
        let mut points = vec![];
        let mut labels = vec![];
        for i in 0..10 {
            points.push([i as f64 * 0.01, 0.0]);
            labels.push(false);
            points.push([10.0 + i as f64 * 0.01, 0.0]);
            labels.push(true);
        }
        let knn = KnnClassifier::fit(5, points, labels).unwrap();
        assert!(!knn.predict([0.5, 0.0]));
        assert!(knn.predict([10.5, 0.0]));
    }

    #[test]
    fn test_predictions_are_deterministic() {
        let points = vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [0.5, 0.5]];
        let labels = vec![true, false, false, true, true];
        let knn = KnnClassifier::fit(5, points, labels).unwrap();
        let queries = [[0.2, 0.2], [0.9, 0.1], [0.5, 0.6]];
        assert_eq!(knn.predict_many(&queries), knn.predict_many(&queries));
    }

    #[test]
    fn test_even_split_votes_negative() {
        let points = vec![[0.0, 0.0], [1.0, 0.0]];
        let labels = vec![true, false];
        let knn = KnnClassifier::fit(2, points, labels).unwrap();
        assert!(!knn.predict([0.5, 0.0]));
    }

    #[test]
    fn test_fit_rejects_empty_training_set() {
        assert!(KnnClassifier::fit(5, vec![], vec![]).is_err());
    }
}
