//! Built-in exercise catalog.
//!
//! Labels are the vocabulary stored workout records and gym analytics group by, so renaming one is
//! a data migration, not a cosmetic change. Entries are matched in this order when two candidates
//! tie.

/// `(label, synonyms, muscles)`
pub(super) const BUILTIN_EXERCISES: &[(&str, &[&str], &[&str])] = &[
    ("bench press", &["flat bench press", "flat bench press machine", "bench machine", "flat bench machine"], &["chest", "triceps", "shoulders"]),
    ("incline bench press", &[], &["chest", "shoulders", "triceps"]),
    ("decline bench press", &[], &["chest", "triceps", "shoulders"]),
    ("dumbbell bench press", &[], &["chest", "triceps", "shoulders"]),
    ("dumbbell fly", &["chest fly"], &["chest", "shoulders"]),
    ("cable crossover", &[], &["chest", "shoulders", "biceps"]),
    ("pec deck machine", &["chest fly machine", "pec deck"], &["chest", "shoulders"]),
    ("chest press machine", &["chest press"], &["chest", "triceps", "shoulders"]),
    ("push-up", &["push ups", "pushup", "pushups"], &["chest", "triceps", "shoulders"]),
    ("incline dumbbell press", &[], &["chest", "shoulders", "triceps"]),
    ("decline dumbbell press", &[], &["chest", "triceps", "shoulders"]),
    ("pull-up", &["pull ups", "pullup", "pullups"], &["back", "biceps", "shoulders"]),
    ("chin-up", &["chin ups", "chinup", "chinups"], &["biceps", "back", "shoulders"]),
    ("lat pulldown", &["lat pulldown machine", "lat pull down", "lat pull down machine"], &["back", "biceps", "shoulders"]),
    ("wide grip pulldown", &[], &["back", "biceps", "shoulders"]),
    ("close grip pulldown", &[], &["back", "biceps", "shoulders"]),
    ("straight arm pulldown", &[], &["back", "shoulders"]),
    ("seated row", &["seated cable row", "seated cable rows", "seated row machine"], &["back", "biceps"]),
    ("t-bar row", &[], &["back", "biceps"]),
    ("bent over row", &[], &["back", "biceps"]),
    ("one arm dumbbell row", &[], &["back", "biceps"]),
    ("chest supported row", &[], &["back", "biceps"]),
    ("lat pullover machine", &[], &["back", "chest"]),
    ("deadlift", &["deadlifts"], &["back", "glutes", "hamstrings"]),
    ("romanian deadlift", &[], &["hamstrings", "glutes", "back"]),
    ("sumo deadlift", &[], &["glutes", "hamstrings", "back"]),
    ("shoulder press machine", &["shoulder press"], &["shoulders", "triceps"]),
    ("overhead press", &[], &["shoulders", "triceps"]),
    ("arnold press", &[], &["shoulders", "triceps"]),
    ("dumbbell shoulder press", &[], &["shoulders", "triceps"]),
    ("front raise", &[], &["shoulders"]),
    ("lateral raise", &[], &["shoulders"]),
    ("lateral raise machine", &["lateral raises machine", "cable lateral raise"], &["shoulders"]),
    ("rear delt fly", &[], &["shoulders", "back"]),
    ("reverse pec deck", &[], &["shoulders", "back"]),
    ("upright row", &[], &["shoulders", "triceps"]),
    ("cable face pull", &[], &["shoulders", "back"]),
    ("barbell curl", &[], &["biceps"]),
    ("dumbbell curl", &[], &["biceps"]),
    ("alternating dumbbell curl", &[], &["biceps"]),
    ("hammer curl", &[], &["biceps"]),
    ("preacher curl", &["arm curl machine", "bicep curl machine", "curl machine", "machine bicep curl", "preacher curl machine"], &["biceps"]),
    ("cable curl", &[], &["biceps"]),
    ("incline dumbbell curl", &[], &["biceps"]),
    ("ez bar curl", &[], &["biceps"]),
    ("reverse curl", &[], &["biceps"]),
    ("spider curl", &[], &["biceps"]),
    ("tricep pushdown", &[], &["triceps", "shoulders"]),
    ("overhead tricep extension", &[], &["triceps", "shoulders"]),
    ("cable overhead extension", &[], &["triceps", "shoulders"]),
    ("close grip bench press", &[], &["triceps", "chest"]),
    ("dips", &["dip"], &["triceps", "chest", "shoulders"]),
    ("seated dip machine", &[], &["triceps", "chest"]),
    ("skull crusher", &[], &["triceps", "shoulders"]),
    ("rope pushdown", &[], &["triceps", "shoulders"]),
    ("single arm cable pushdown", &[], &["triceps"]),
    ("diamond push-up", &[], &["triceps", "chest", "shoulders"]),
    ("squat", &["squats", "back squat"], &["quads", "glutes", "hamstrings"]),
    ("hack squat", &[], &["quads", "glutes", "hamstrings"]),
    ("leg press", &["leg press machine"], &["quads", "glutes", "hamstrings"]),
    ("leg extension", &["leg extension machine"], &["quads"]),
    ("bulgarian split squat", &[], &["quads", "glutes"]),
    ("smith machine squat", &[], &["quads", "glutes", "hamstrings"]),
    ("v squat", &[], &["quads", "glutes", "hamstrings"]),
    ("smith machine bench press", &["smith machine flat bench press"], &["chest", "triceps", "shoulders"]),
    ("smith machine incline bench press", &[], &["chest", "shoulders", "triceps"]),
    ("smith machine decline bench press", &[], &["chest", "triceps", "shoulders"]),
    ("smith machine shoulder press", &[], &["shoulders", "triceps"]),
    ("goblet squat", &[], &["quads", "glutes", "hamstrings"]),
    ("lying leg curl", &["leg curl machine", "reg curl machine", "lying leg curl machine"], &["hamstrings", "glutes"]),
    ("seated leg curl machine", &["seated leg curl"], &["hamstrings", "glutes"]),
    ("good morning", &[], &["hamstrings", "glutes", "back"]),
    ("hip thrust", &["hip thruster", "hip truster"], &["glutes", "hamstrings"]),
    ("cable kickback", &[], &["glutes", "hamstrings"]),
    ("abductor machine", &["hip abductor machine", "hip abductor"], &["glutes"]),
    ("adductor machine", &[], &["glutes"]),
    ("standing calf raise", &[], &["calves"]),
    ("seated calf raise", &[], &["calves"]),
    ("leg press calf raise", &[], &["calves"]),
    ("donkey calf raise", &[], &["calves"]),
    ("crunch", &["crunches"], &["abs"]),
    ("cable crunch", &[], &["abs"]),
    ("decline sit-up", &[], &["abs"]),
    ("hanging leg raise", &[], &["abs"]),
    ("knee raise", &[], &["abs"]),
    ("russian twist", &[], &["abs", "back"]),
    ("rotary torso machine", &["rotary torso", "torso machine", "torso rotation machine"], &["abs", "back"]),
    ("chinning dipping", &[], &[]),
    ("leg raise tower", &[], &[]),
    ("smith machine", &["smith"], &[]),
    ("dumbbell", &[], &[]),
];
