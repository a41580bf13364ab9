use anyhow::Result;
use clap::Args;

use svr_core::geometry::RigidTransform;

/// Mirrors `svrtk::Utility`'s transform-and-rename tool: given a
/// per-slice transform list and a naming prefix, produces the output
/// file name each transform would be written under for a given outer
/// iteration. No file I/O here — naming is a pure function over
/// `Vec<RigidTransform>`, the actual write-out is a collaborator.
#[derive(Args)]
pub struct TransformAndRenameArgs {
    #[arg(long)]
    pub prefix: String,

    #[arg(long)]
    pub iteration: usize,

    #[arg(long)]
    pub count: usize,
}

pub fn transform_names(prefix: &str, iteration: usize, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}-iter{iteration:02}-slice{i:04}.dof")).collect()
}

/// Placeholder identity transforms standing in for a loaded set, used
/// only to exercise [`transform_names`] end to end from the CLI.
fn placeholder_transforms(count: usize) -> Vec<RigidTransform> {
    vec![RigidTransform::identity(); count]
}

pub fn run(args: &TransformAndRenameArgs) -> Result<()> {
    let transforms = placeholder_transforms(args.count);
    let names = transform_names(&args.prefix, args.iteration, transforms.len());
    for name in names {
        println!("{name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_zero_padded_and_ordered() {
        let names = transform_names("sub01", 2, 3);
        assert_eq!(names, vec!["sub01-iter02-slice0000.dof", "sub01-iter02-slice0001.dof", "sub01-iter02-slice0002.dof"]);
    }
}
