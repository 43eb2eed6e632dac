/*!
Развёртка событий.

Событие превращается в список полей, отсортированный по пути: путь —
шаги через `.`, значение — в текстовой JSON-форме (строки в кавычках,
литералы без), плюс принадлежность массивам. Каждый массив события
получает свежий идентификатор, и каждое поле запоминает, внутри каких
массивов и на каких позициях оно находится; это позволяет отбрасывать
совпадения, «сшитые» из соседних элементов одного массива.
*/

use bstr::ByteSlice;
use serde_json::{Map, Value};

use crate::{Error, ErrorKind, pattern::json_quote};

/// Принадлежность поля массивам события: разреженное отображение
/// «идентификатор массива → индекс элемента».
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ArrayMembership {
    // Sorted by array identifier.
    entries: Vec<(u32, u32)>,
}

impl ArrayMembership {
    /// Истинно, если поле не лежит ни в одном массиве.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Две принадлежности согласованы, если для каждого общего массива
    /// они указывают на один и тот же элемент.
    pub fn is_consistent_with(&self, other: &ArrayMembership) -> bool {
        let mut left = self.entries.iter().peekable();
        let mut right = other.entries.iter().peekable();
        while let (Some(&&(la, li)), Some(&&(ra, ri))) =
            (left.peek(), right.peek())
        {
            if la < ra {
                left.next();
            } else if ra < la {
                right.next();
            } else if li != ri {
                return false;
            } else {
                left.next();
                right.next();
            }
        }
        true
    }

    /// Объединяет две согласованные принадлежности; `None` при
    /// рассогласовании.
    pub(crate) fn merged(
        &self,
        other: &ArrayMembership,
    ) -> Option<ArrayMembership> {
        if !self.is_consistent_with(other) {
            return None;
        }
        let mut entries = self.entries.clone();
        for &(array, index) in &other.entries {
            match entries.binary_search_by_key(&array, |&(a, _)| a) {
                Ok(_) => {}
                Err(pos) => entries.insert(pos, (array, index)),
            }
        }
        Some(ArrayMembership { entries })
    }

    fn with(&self, array: u32, index: u32) -> ArrayMembership {
        let mut entries = self.entries.clone();
        match entries.binary_search_by_key(&array, |&(a, _)| a) {
            // Array identifiers are fresh per array, so a collision
            // cannot happen during flattening.
            Ok(pos) => entries[pos] = (array, index),
            Err(pos) => entries.insert(pos, (array, index)),
        }
        ArrayMembership { entries }
    }
}

/// Одно поле развёрнутого события.
#[derive(Clone, Eq, PartialEq)]
pub struct Field {
    path: String,
    value: String,
    membership: ArrayMembership,
}

impl Field {
    /// Путь поля: шаги, соединённые `.`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Значение поля в текстовой JSON-форме.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Принадлежность поля массивам события.
    pub fn membership(&self) -> &ArrayMembership {
        &self.membership
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("path", &self.path)
            .field("value", &self.value.as_bytes().as_bstr())
            .field("membership", &self.membership)
            .finish()
    }
}

/// Развёрнутое событие: поля, отсортированные по пути.
#[derive(Clone, Debug)]
pub struct Event {
    fields: Vec<Field>,
}

impl Event {
    /// Разворачивает JSON-событие. Верхний уровень обязан быть объектом.
    pub fn from_json(event_json: &str) -> Result<Event, Error> {
        let value: Value =
            serde_json::from_str(event_json).map_err(|err| {
                Error::new(ErrorKind::MalformedJson(err.to_string()))
            })?;
        let Value::Object(ref map) = value else {
            return Err(Error::new(ErrorKind::MalformedJson(
                "event must be a JSON object".to_string(),
            )));
        };
        let mut fields = vec![];
        let mut next_array = 0u32;
        flatten_object(
            map,
            "",
            &ArrayMembership::default(),
            &mut next_array,
            &mut fields,
        );
        fields.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Event { fields })
    }

    /// Строит событие из чередующегося списка «имя, значение», заранее
    /// отсортированного по именам; принадлежность массивам не
    /// отслеживается.
    pub(crate) fn from_name_values<S: AsRef<str>>(pairs: &[S]) -> Event {
        let mut fields = vec![];
        for pair in pairs.chunks(2) {
            if let [name, value] = pair {
                fields.push(Field {
                    path: name.as_ref().to_string(),
                    value: value.as_ref().to_string(),
                    membership: ArrayMembership::default(),
                });
            }
        }
        Event { fields }
    }

    /// Поля события в отсортированном порядке.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Есть ли в событии лист с данным путём, согласованный с данной
    /// принадлежностью. Отсутствие ключа внутри элемента массива
    /// проверяется относительно той же принадлежности.
    pub(crate) fn has_field(
        &self,
        path: &str,
        membership: Option<&ArrayMembership>,
    ) -> bool {
        self.fields.iter().any(|field| {
            field.path == path
                && membership
                    .is_none_or(|m| m.is_consistent_with(&field.membership))
        })
    }
}

fn flatten_object(
    map: &Map<String, Value>,
    path: &str,
    membership: &ArrayMembership,
    next_array: &mut u32,
    out: &mut Vec<Field>,
) {
    for (key, value) in map {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        flatten_value(value, &child_path, membership, next_array, out);
    }
}

fn flatten_value(
    value: &Value,
    path: &str,
    membership: &ArrayMembership,
    next_array: &mut u32,
    out: &mut Vec<Field>,
) {
    match *value {
        Value::Object(ref map) => {
            flatten_object(map, path, membership, next_array, out);
        }
        Value::Array(ref items) => {
            let array = *next_array;
            *next_array += 1;
            for (index, item) in items.iter().enumerate() {
                flatten_value(
                    item,
                    path,
                    &membership.with(array, index as u32),
                    next_array,
                    out,
                );
            }
        }
        Value::String(ref s) => out.push(Field {
            path: path.to_string(),
            value: json_quote(s),
            membership: membership.clone(),
        }),
        Value::Number(ref n) => out.push(Field {
            path: path.to_string(),
            value: n.to_string(),
            membership: membership.clone(),
        }),
        Value::Bool(b) => out.push(Field {
            path: path.to_string(),
            value: b.to_string(),
            membership: membership.clone(),
        }),
        Value::Null => out.push(Field {
            path: path.to_string(),
            value: "null".to_string(),
            membership: membership.clone(),
        }),
    }
}
