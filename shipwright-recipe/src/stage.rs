//! Stage splitting (C2): grouping a flat instruction list by `FROM` boundary.

use crate::error::{Error, Result};
use crate::instruction::Instruction;

/// The parent a stage builds from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageParent {
    /// An externally pulled image reference.
    Image(String),
    /// The index of an earlier stage in the same recipe.
    Stage(usize),
    /// The empty `scratch` pseudo-image.
    Scratch,
}

/// One `FROM`-delimited build stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Position of this stage among all stages, in source order.
    pub index: usize,
    /// The stage's `AS <name>` alias, if any.
    pub name: Option<String>,
    /// Ordered instructions belonging to this stage, including its `FROM`.
    pub instructions: Vec<Instruction>,
    /// This stage's direct parent.
    pub parent: StageParent,
}

impl Stage {
    /// Returns the indices of every earlier stage this stage's `COPY
    /// --from=` instructions reference, plus its parent stage if any.
    #[must_use]
    pub fn depends_on(&self, stages: &Stages) -> Vec<usize> {
        let mut deps = Vec::new();
        if let StageParent::Stage(i) = self.parent {
            deps.push(i);
        }
        for instruction in &self.instructions {
            if let Instruction::Copy {
                from_stage: Some(from),
                ..
            } = instruction
                && let Some(stage) = stages.get(from)
                && !deps.contains(&stage.index)
            {
                deps.push(stage.index);
            }
        }
        deps
    }
}

/// All stages parsed from one recipe, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stages {
    stages: Vec<Stage>,
}

impl Stages {
    /// Splits a flat instruction list into stages at each `FROM` boundary.
    ///
    /// Validates that exactly one stage is unnamed, that it is the last
    /// stage, and that every `COPY --from=` reference names an earlier stage.
    /// Instructions preceding the first `FROM` are rejected: a recipe must
    /// open with `FROM`.
    pub fn split(instructions: Vec<Instruction>) -> Result<Self> {
        let mut stages: Vec<Stage> = Vec::new();

        for instruction in instructions {
            if let Instruction::From {
                base_image,
                stage_name,
                ..
            } = &instruction
            {
                let parent = if base_image.eq_ignore_ascii_case("scratch") {
                    StageParent::Scratch
                } else if let Some(found) = stages
                    .iter()
                    .find(|s| s.name.as_deref() == Some(base_image.as_str()))
                {
                    StageParent::Stage(found.index)
                } else {
                    StageParent::Image(base_image.clone())
                };

                let index = stages.len();
                stages.push(Stage {
                    index,
                    name: stage_name.clone(),
                    instructions: vec![instruction],
                    parent,
                });
            } else {
                let Some(last) = stages.last_mut() else {
                    return Err(Error::Stage(
                        "recipe has instructions before the first FROM".into(),
                    ));
                };
                last.instructions.push(instruction);
            }
        }

        if stages.is_empty() {
            return Err(Error::Stage("recipe has no FROM instruction".into()));
        }

        let built = Self { stages };
        built.validate()?;
        Ok(built)
    }

    /// Structural validation: exactly one unnamed stage, and it is last;
    /// every cross-stage `COPY --from=` reference resolves.
    fn validate(&self) -> Result<()> {
        let unnamed: Vec<usize> = self
            .stages
            .iter()
            .filter(|s| s.name.is_none())
            .map(|s| s.index)
            .collect();

        if unnamed.len() != 1 {
            return Err(Error::Stage(format!(
                "expected exactly one unnamed (final) stage, found {}",
                unnamed.len()
            )));
        }
        if unnamed[0] != self.stages.len() - 1 {
            return Err(Error::Stage(
                "the unnamed stage must be the last stage in the recipe".into(),
            ));
        }

        for stage in &self.stages {
            for instruction in &stage.instructions {
                if let Instruction::Copy {
                    from_stage: Some(from),
                    ..
                } = instruction
                {
                    match self.get(from) {
                        Some(target) if target.index < stage.index => {}
                        Some(_) => {
                            return Err(Error::Stage(format!(
                                "COPY --from={from} must reference a stage defined earlier in the recipe"
                            )));
                        }
                        None => {
                            return Err(Error::Stage(format!(
                                "COPY --from={from} does not reference a known earlier stage"
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Looks up a stage by numeric index or by its `AS` alias.
    #[must_use]
    pub fn get(&self, s: &str) -> Option<&Stage> {
        if let Ok(index) = s.parse::<usize>() {
            return self.stages.get(index);
        }
        self.named_stage(s)
    }

    /// Looks up a stage by its `AS` alias.
    #[must_use]
    pub fn named_stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name.as_deref() == Some(name))
    }

    /// The final, unnamed stage: the one that gets run.
    #[must_use]
    pub fn unnamed(&self) -> &Stage {
        self.stages
            .iter()
            .find(|s| s.name.is_none())
            .expect("validate() guarantees exactly one unnamed stage")
    }

    /// All named (dependency) stages.
    pub fn named(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|s| s.name.is_some())
    }

    /// All stages, in source order.
    #[must_use]
    pub fn all(&self) -> &[Stage] {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader;

    fn stages(text: &str) -> Stages {
        Stages::split(reader::parse(text).unwrap()).unwrap()
    }

    #[test]
    fn splits_named_and_unnamed_stages() {
        let s = stages(
            "FROM golang:1.22 AS builder\nRUN go build -o /out/app\nFROM alpine\nCOPY --from=builder /out/app /usr/local/bin/app\n",
        );
        assert_eq!(s.all().len(), 2);
        assert_eq!(s.named_stage("builder").unwrap().index, 0);
        assert_eq!(s.unnamed().index, 1);
    }

    #[test]
    fn rejects_two_unnamed_stages() {
        let instructions = reader::parse("FROM alpine\nFROM alpine\n").unwrap();
        let err = Stages::split(instructions).unwrap_err();
        assert!(matches!(err, Error::Stage(_)));
    }

    #[test]
    fn rejects_unnamed_stage_not_last() {
        let instructions =
            reader::parse("FROM alpine\nFROM alpine AS builder\nRUN echo hi\n").unwrap();
        let err = Stages::split(instructions).unwrap_err();
        assert!(matches!(err, Error::Stage(_)));
    }

    #[test]
    fn rejects_unknown_copy_from() {
        let instructions =
            reader::parse("FROM alpine\nCOPY --from=missing /a /b\n").unwrap();
        let err = Stages::split(instructions).unwrap_err();
        assert!(matches!(err, Error::Stage(_)));
    }

    #[test]
    fn rejects_copy_from_referencing_a_later_stage() {
        let instructions = reader::parse(
            "FROM alpine AS first\nCOPY --from=second /out/app /usr/local/bin/app\nFROM golang:1.22 AS second\nRUN go build -o /out/app\nFROM alpine\nRUN echo hi\n",
        )
        .unwrap();
        let err = Stages::split(instructions).unwrap_err();
        assert!(matches!(err, Error::Stage(_)));
    }

    #[test]
    fn stage_from_named_stage_resolves_to_stage_parent() {
        let s = stages("FROM alpine AS base\nFROM base\nRUN echo hi\n");
        assert_eq!(s.unnamed().parent, StageParent::Stage(0));
    }
}
