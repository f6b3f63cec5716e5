use serde::Serialize;

/// Drift below this is treated as exact when checking feasibility.
pub const WEIGHT_EPSILON: f64 = 1e-15;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bucket {
    Stocks,
    Bonds,
    Contributions,
    Safe,
    ExistingIncome,
    NewAnnuities,
}

impl Bucket {
    pub const ALL: [Bucket; 6] = [
        Bucket::Stocks,
        Bucket::Bonds,
        Bucket::Contributions,
        Bucket::Safe,
        Bucket::ExistingIncome,
        Bucket::NewAnnuities,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Bucket::Stocks => "stocks",
            Bucket::Bonds => "regular bonds",
            Bucket::Contributions => "future contribs",
            Bucket::Safe => "LM bonds",
            Bucket::ExistingIncome => "defined benefits",
            Bucket::NewAnnuities => "new annuities",
        }
    }
}

/// Fractions of total net worth held in each bucket.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationWeights {
    pub stocks: f64,
    pub bonds: f64,
    pub contributions: f64,
    pub safe: f64,
    pub existing_income: f64,
    pub new_annuities: f64,
}

impl AllocationWeights {
    pub fn get(&self, bucket: Bucket) -> f64 {
        match bucket {
            Bucket::Stocks => self.stocks,
            Bucket::Bonds => self.bonds,
            Bucket::Contributions => self.contributions,
            Bucket::Safe => self.safe,
            Bucket::ExistingIncome => self.existing_income,
            Bucket::NewAnnuities => self.new_annuities,
        }
    }

    pub fn sum(&self) -> f64 {
        self.stocks
            + self.bonds
            + self.contributions
            + self.safe
            + self.existing_income
            + self.new_annuities
    }

    pub fn guaranteed(&self) -> f64 {
        self.existing_income + self.new_annuities
    }

    pub fn investments(&self) -> f64 {
        self.stocks + self.bonds + self.safe
    }

    pub fn map(self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            stocks: f(self.stocks),
            bonds: f(self.bonds),
            contributions: f(self.contributions),
            safe: f(self.safe),
            existing_income: f(self.existing_income),
            new_annuities: f(self.new_annuities),
        }
    }

    pub fn is_feasible(&self, tolerance: f64) -> bool {
        Bucket::ALL.iter().all(|&b| self.get(b) >= -tolerance)
            && (self.sum() - 1.0).abs() <= tolerance
    }

    /// Floors floating-point drift at zero and restores the unit sum.
    pub fn settle(self) -> Self {
        let floored = self.map(|w| w.max(0.0));
        let total = floored.sum();
        if total <= 0.0 {
            return Self {
                safe: 1.0,
                ..Self::default()
            };
        }
        if total == 1.0 {
            return floored;
        }
        let mut scaled = floored.map(|w| w / total);
        // Park the last ulp of rounding in the largest bucket.
        let residue = 1.0 - scaled.sum();
        let largest = Bucket::ALL
            .iter()
            .copied()
            .max_by(|a, b| scaled.get(*a).total_cmp(&scaled.get(*b)))
            .unwrap_or(Bucket::Safe);
        *scaled.get_mut(largest) += residue;
        scaled
    }

    fn get_mut(&mut self, bucket: Bucket) -> &mut f64 {
        match bucket {
            Bucket::Stocks => &mut self.stocks,
            Bucket::Bonds => &mut self.bonds,
            Bucket::Contributions => &mut self.contributions,
            Bucket::Safe => &mut self.safe,
            Bucket::ExistingIncome => &mut self.existing_income,
            Bucket::NewAnnuities => &mut self.new_annuities,
        }
    }

    /// The portion not held as guaranteed income (and optionally not as
    /// pending contributions), renormalized. All zero when nothing remains.
    pub fn non_annuitized(&self, include_contributions: bool) -> Self {
        let kept = Self {
            contributions: if include_contributions {
                self.contributions
            } else {
                0.0
            },
            existing_income: 0.0,
            new_annuities: 0.0,
            ..*self
        };
        let total = kept.sum();
        if total == 0.0 {
            return Self::default();
        }
        kept.map(|w| w / total)
    }
}
