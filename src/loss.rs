//! Loss functions evaluated on the worker side.

/// A margin-based loss over labels in `{-1, +1}` (labels `<= 0` count as -1).
pub trait Loss: Send + Sync {
    /// Per-example objective at `margin`.
    fn objective(&self, label: f32, margin: f32) -> f32;

    /// Derivative of the objective with respect to the margin.
    fn gradient(&self, label: f32, margin: f32) -> f32;

    fn is_correct(&self, label: f32, margin: f32) -> bool {
        (label > 0.0) == (margin > 0.0)
    }
}

/// Logistic loss `log(1 + exp(-y * m))`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogitLoss;

fn sign(label: f32) -> f32 {
    if label > 0.0 {
        1.0
    } else {
        -1.0
    }
}

impl Loss for LogitLoss {
    fn objective(&self, label: f32, margin: f32) -> f32 {
        let z = -sign(label) * margin;
        // log1p(exp(z)) without overflow
        if z > 0.0 {
            z + (-z).exp().ln_1p()
        } else {
            z.exp().ln_1p()
        }
    }

    fn gradient(&self, label: f32, margin: f32) -> f32 {
        let y = sign(label);
        -y / (1.0 + (y * margin).exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logit_at_zero_margin() {
        let loss = LogitLoss;
        assert!((loss.objective(1.0, 0.0) - 2f32.ln()).abs() < 1e-6);
        assert!((loss.gradient(1.0, 0.0) + 0.5).abs() < 1e-6);
        assert!((loss.gradient(-1.0, 0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_logit_large_margins_are_finite() {
        let loss = LogitLoss;
        assert!(loss.objective(-1.0, 200.0).is_finite());
        assert!(loss.objective(1.0, 200.0) < 1e-6);
        assert!(loss.is_correct(0.0, -3.0));
    }
}
