//! Sentence compilation: DSL syntax trees to validated predicates.
//!
//! Variable types come from their names: `Person1` is a variable of type
//! `Person` (or `person`, when no exact match exists). Trailing digits only
//! distinguish variables of the same type.

use termdb_dsl::{parse_sentence, Operand, Sentence, Word};

use crate::error::{Error, Result};
use crate::model::{Predicate, Value, Var, Verb};
use crate::taxonomy::{Taxonomy, TermId};

/// Parse and compile one sentence.
pub fn parse_predicate(tax: &Taxonomy, text: &str) -> Result<Predicate> {
    let sentence = parse_sentence(text)?;
    compile_sentence(tax, &sentence)
}

pub fn compile_sentence(tax: &Taxonomy, sentence: &Sentence) -> Result<Predicate> {
    let verb = match &sentence.verb {
        Word::Symbol(name) => Verb::Term(tax.get_term(name)?),
        Word::Var(name) => Verb::Var(var_from_name(tax, name)?),
    };
    let mut builder = Predicate::builder(tax, verb).truth(sentence.truth);
    if let Some(binder) = &sentence.binder {
        builder = builder.redundant_var(var_from_name(tax, binder)?);
    }
    for (label, operand) in sentence.labeled_operands() {
        builder = builder.object(label, operand_value(tax, operand)?);
    }
    builder.build()
}

fn operand_value(tax: &Taxonomy, operand: &Operand) -> Result<Value> {
    Ok(match operand {
        Operand::Word(Word::Symbol(name)) => Value::Term(tax.get_term(name)?),
        Operand::Word(Word::Var(name)) => Value::Var(var_from_name(tax, name)?),
        Operand::Number(n) => Value::Number(*n),
        Operand::Sentence(inner) => Value::Pred(Box::new(compile_sentence(tax, inner)?)),
        Operand::Set { var, condition } => {
            Value::Var(var_from_name(tax, var)?.with_condition(condition.clone()))
        }
    })
}

/// The type a variable name denotes: the name without trailing digits.
pub fn var_type_name(name: &str) -> &str {
    name.trim_end_matches(|c: char| c.is_ascii_digit())
}

fn var_from_name(tax: &Taxonomy, name: &str) -> Result<Var> {
    let ty = lookup_type(tax, var_type_name(name))?;
    tax.make_var(name, ty)
}

fn lookup_type(tax: &Taxonomy, type_name: &str) -> Result<TermId> {
    if let Some(id) = tax.lookup(type_name) {
        return Ok(id);
    }
    tax.iter()
        .find(|t| !t.individual && t.name.eq_ignore_ascii_case(type_name))
        .map(|t| t.id)
        .ok_or_else(|| Error::UnknownTerm(type_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VarKind;

    fn tax() -> Taxonomy {
        let mut tax = Taxonomy::new();
        let thing = tax.vocabulary().thing;
        let number = tax.vocabulary().number;
        let person = tax.add_subterm("person", &[thing], &[]).unwrap();
        tax.add_verb("aged", &[], &[("years", number)]).unwrap();
        tax.add_term("john", person).unwrap();
        tax
    }

    #[test]
    fn variable_types_come_from_names() {
        let tax = tax();
        let p = parse_predicate(&tax, "(aged Person1, years {Number1: Number1 > 3})").unwrap();
        let vars = p.variables();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].name, "Person1");
        assert_eq!(vars[0].kind, VarKind::Entity);
        assert_eq!(vars[1].kind, VarKind::Number);
        assert!(vars[1].condition.is_some());
    }

    #[test]
    fn unknown_words_are_errors() {
        let tax = tax();
        assert!(matches!(
            parse_predicate(&tax, "(aged bob)"),
            Err(Error::UnknownTerm(name)) if name == "bob"
        ));
        assert!(matches!(
            parse_predicate(&tax, "(aged john, colour red)"),
            Err(Error::UnknownTerm(_))
        ));
        assert!(matches!(
            parse_predicate(&tax, "(aged john, years"),
            Err(Error::Syntax(_))
        ));
    }

    #[test]
    fn trailing_digits_are_stripped() {
        assert_eq!(var_type_name("Person12"), "Person");
        assert_eq!(var_type_name("Exist"), "Exist");
    }
}
