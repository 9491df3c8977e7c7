use tch::nn;

/// Step decay: `lr = initial * gamma^floor(epoch / step_size)`.
#[derive(Debug, Clone)]
pub struct StepLr {
    initial_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(initial_lr: f64, step_size: usize, gamma: f64) -> StepLr {
        StepLr {
            initial_lr,
            step_size,
            gamma,
            epoch: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        if self.step_size == 0 {
            return self.initial_lr;
        }
        self.initial_lr * self.gamma.powi((self.epoch / self.step_size) as i32)
    }

    /// Advances one epoch and pushes the new rate into the optimizer.
    pub fn step(&mut self, opt: &mut nn::Optimizer) {
        self.advance();
        opt.set_lr(self.lr());
    }

    fn advance(&mut self) {
        self.epoch += 1;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}
