/// Tick number and timestep handed to every lifecycle call of one simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Frame {
    pub tick: u64,
    pub dt: f32,
}

/// Discrete simulation clock. Ticks start at 1 so tick 0 never appears in logs.
#[derive(Debug, Clone, Default)]
pub struct TickClock {
    tick: u64,
    elapsed: f64,
    last_dt: f32,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, dt: f32) -> Frame {
        self.tick += 1;
        self.last_dt = dt;
        self.elapsed += dt as f64;
        Frame { tick: self.tick, dt }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn delta_seconds(&self) -> f32 {
        self.last_dt
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed
    }

    pub fn current_frame(&self) -> Frame {
        Frame { tick: self.tick, dt: self.last_dt }
    }
}
