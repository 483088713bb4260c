/// Progress gate: a stage is unlockable once project progress reaches its threshold.
pub fn is_unlocked(project_progress: u8, required_progress: u8) -> bool {
    project_progress >= required_progress
}
